use crate::{Config, PostsError, PostsManager};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartupCheckError {
    #[error("Failed to create posts directory: {0}")]
    PostsDirectoryCreationFailed(#[from] std::io::Error),

    #[error("Posts directory is not a directory: {0}")]
    PostsDirectoryInvalid(String),

    #[error("Post index cannot be opened: {0}")]
    IndexUnavailable(PostsError),
}

/// Makes sure the posts root exists and the index can be opened. An index
/// that disagrees with the post directories is only reported as a warning;
/// `reload` repairs it.
pub async fn perform_startup_checks(config: &Config) -> Result<(), Vec<StartupCheckError>> {
    let mut errors = Vec::new();
    let posts_dir = &config.posts.source_directory;

    info!("Performing startup checks...");

    match tokio::fs::metadata(posts_dir).await {
        Ok(metadata) if metadata.is_dir() => {
            info!("Posts directory exists: {:?}", posts_dir);
        }
        Ok(_) => {
            error!("Posts directory is not a directory: {:?}", posts_dir);
            errors.push(StartupCheckError::PostsDirectoryInvalid(
                posts_dir.display().to_string(),
            ));
        }
        Err(_) => {
            info!("Posts directory does not exist, creating: {:?}", posts_dir);
            if let Err(e) = tokio::fs::create_dir_all(posts_dir).await {
                error!("Failed to create posts directory: {}", e);
                errors.push(StartupCheckError::PostsDirectoryCreationFailed(e));
            }
        }
    }

    if errors.is_empty() {
        let manager = PostsManager::new(config.posts.clone());
        match manager.check_consistency().await {
            Ok(report) if report.is_consistent() => {
                info!("Post index is consistent with the posts directory");
            }
            Ok(report) => {
                warn!(
                    "Post index needs a reload: {} missing, {} orphaned, {} unreadable",
                    report.missing_from_index.len(),
                    report.orphaned_entries.len(),
                    report.unreadable.len()
                );
            }
            Err(e) => {
                error!("Post index is not accessible: {}", e);
                errors.push(StartupCheckError::IndexUnavailable(e));
            }
        }
    }

    if errors.is_empty() {
        info!("All startup checks passed");
        Ok(())
    } else {
        error!("Startup checks failed with {} errors", errors.len());
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posts::PostsConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_missing_posts_directory() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            posts: PostsConfig::with_source_directory(temp_dir.path().join("posts")),
            ..Default::default()
        };

        perform_startup_checks(&config).await.unwrap();
        assert!(temp_dir.path().join("posts").is_dir());
        assert!(temp_dir.path().join("posts/index.db").is_file());
    }

    #[tokio::test]
    async fn test_rejects_file_as_posts_directory() {
        let temp_dir = TempDir::new().unwrap();
        let not_a_dir = temp_dir.path().join("posts");
        std::fs::write(&not_a_dir, b"oops").unwrap();
        let config = Config {
            posts: PostsConfig::with_source_directory(not_a_dir),
            ..Default::default()
        };

        let errors = perform_startup_checks(&config).await.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            StartupCheckError::PostsDirectoryInvalid(_)
        ));
    }
}
