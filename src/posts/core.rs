use super::{
    codec,
    error::PostsError,
    index::ChronologicalIndex,
    slug::{is_normalized, slugify},
    tree::PostTree,
    types::*,
    upload::{validate_file_name, write_upload},
};
use chrono::Utc;
use std::{collections::BTreeSet, io::ErrorKind, path::PathBuf};
use tracing::{debug, info, warn};

/// Coordinates the post directories and the chronological index.
///
/// Every mutation runs a fixed sequence of filesystem and index steps. A
/// failure part way through leaves the earlier steps in place; the post
/// directories are authoritative and [`PostsManager::reload`] brings the
/// index back in line with them.
#[derive(Debug, Clone)]
pub struct PostsManager {
    config: PostsConfig,
    tree: PostTree,
    index: ChronologicalIndex,
}

impl PostsManager {
    pub fn new(config: PostsConfig) -> Self {
        let tree = PostTree::new(config.source_directory.clone());
        let index = ChronologicalIndex::new(config.index_path());
        Self {
            config,
            tree,
            index,
        }
    }

    pub fn get_config(&self) -> &PostsConfig {
        &self.config
    }

    pub fn tree(&self) -> &PostTree {
        &self.tree
    }

    pub fn index(&self) -> &ChronologicalIndex {
        &self.index
    }

    pub async fn create_post(&self, input: CreatePostInput) -> Result<PostIdentity, PostsError> {
        let CreatePostInput {
            title,
            body,
            date,
            slug,
            summary,
            upload,
        } = input;

        let title = title.trim();
        if title.is_empty() {
            return Err(PostsError::Validation("Post needs title".to_string()));
        }

        let slug = match slug.as_deref().map(str::trim) {
            Some(given) if !given.is_empty() => slugify(given),
            _ => slugify(title),
        };
        if slug.is_empty() {
            return Err(PostsError::Validation(format!(
                "Cannot derive a slug from {:?}",
                title
            )));
        }

        if let Some(upload) = &upload {
            validate_file_name(&upload.file_name)?;
        }

        let record = PostRecord {
            title: title.to_string(),
            body,
            date: date.unwrap_or_else(|| Utc::now().timestamp_millis()),
            image: upload.as_ref().map(|u| u.file_name.clone()),
            summary,
        };
        let identity = PostIdentity::new(record.date, slug);

        self.tree.ensure_root().await?;
        let directory = self.tree.directory_for(&identity.slug);
        self.tree.create_directory(&directory).await?;
        self.tree
            .write_record(&directory, &codec::encode(&record)?)
            .await?;

        if let Some(upload) = upload {
            write_upload(&self.tree, &directory, upload).await?;
        }

        let handle = self.index.open().await?;
        handle.put(&identity, &self.projection(&record))?;
        handle.close();

        info!("Created post {}", identity);
        Ok(identity)
    }

    pub async fn update_post(
        &self,
        identity: &PostIdentity,
        input: UpdatePostInput,
    ) -> Result<PostIdentity, PostsError> {
        let UpdatePostInput {
            title,
            body,
            date,
            slug,
            summary,
            upload,
        } = input;

        let (current_directory, current) = self.read_post(identity).await?;

        let title = match title {
            Some(title) if title.trim().is_empty() => {
                return Err(PostsError::Validation("Post needs title".to_string()));
            }
            Some(title) => title.trim().to_string(),
            None => current.title,
        };

        // A blank slug field means "keep the current slug", as on create.
        let final_slug = match slug.as_deref().map(str::trim) {
            Some(given) if !given.is_empty() => {
                let normalized = slugify(given);
                if normalized.is_empty() {
                    return Err(PostsError::Validation(format!(
                        "Cannot derive a slug from {:?}",
                        given
                    )));
                }
                normalized
            }
            _ => identity.slug.clone(),
        };

        if let Some(upload) = &upload {
            validate_file_name(&upload.file_name)?;
        }

        let record = PostRecord {
            title,
            body: body.unwrap_or(current.body),
            date: date.unwrap_or(current.date),
            image: upload
                .as_ref()
                .map(|u| u.file_name.clone())
                .or(current.image),
            summary: summary.or(current.summary),
        };
        let final_identity = PostIdentity::new(record.date, final_slug);
        let will_rename = final_identity.slug != identity.slug;
        let will_redate = final_identity.date != identity.date;

        let final_directory = if will_rename {
            let destination = self.tree.directory_for(&final_identity.slug);
            self.tree
                .rename_directory(&current_directory, &destination)
                .await?;
            destination
        } else {
            current_directory
        };
        self.tree
            .write_record(&final_directory, &codec::encode(&record)?)
            .await?;

        let projection = self.projection(&record);
        let handle = self.index.open().await?;
        if will_rename || will_redate {
            if !handle.move_entry(identity, &final_identity, &projection)? {
                warn!("Index had no entry for {} before moving it", identity);
            }
        } else {
            handle.put(&final_identity, &projection)?;
        }
        handle.close();

        if let Some(upload) = upload {
            write_upload(&self.tree, &final_directory, upload).await?;
        }

        if will_rename || will_redate {
            info!("Updated post {} -> {}", identity, final_identity);
        } else {
            info!("Updated post {}", final_identity);
        }
        Ok(final_identity)
    }

    /// Removes a post's directory, then its index entry. A missing index
    /// entry is tolerated; a missing directory is not.
    pub async fn delete_post(&self, identity: &PostIdentity) -> Result<(), PostsError> {
        let directory = match self.read_post(identity).await {
            Ok((directory, _)) => directory,
            // The directory exists but its record is unreadable; still removable.
            Err(PostsError::CorruptRecord(reason)) => {
                warn!("Deleting post {} with unreadable record: {}", identity, reason);
                self.tree.directory_for(&identity.slug)
            }
            Err(e) => return Err(e),
        };

        match self.tree.remove_directory_recursive(&directory).await {
            Err(PostsError::IoError(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(PostsError::PostNotFound(identity.to_string()));
            }
            result => result?,
        }

        let handle = self.index.open().await?;
        if !handle.remove(identity)? {
            warn!("Deleted post {} had no index entry", identity);
        }
        handle.close();

        info!("Deleted post {}", identity);
        Ok(())
    }

    pub async fn get_post(&self, identity: &PostIdentity) -> Result<Post, PostsError> {
        let (_, record) = self.read_post(identity).await?;
        Ok(Post::from_record(identity.slug.clone(), record))
    }

    /// Newest-first page of the index. Never reads post directories.
    pub async fn list_posts(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<PostEntry>, PostsError> {
        let offset = page.saturating_mul(page_size);
        let handle = self.index.open().await?;
        let entries = handle.page(None, offset, page_size, ScanDirection::NewestFirst)?;
        handle.close();
        debug!(
            "Listed {} posts for page {} (size {})",
            entries.len(),
            page,
            page_size
        );
        Ok(entries)
    }

    /// Cursor-based listing: up to `limit` entries strictly after `cursor`.
    pub async fn list_posts_after(
        &self,
        cursor: Option<&PostIdentity>,
        limit: usize,
        direction: ScanDirection,
    ) -> Result<Vec<PostEntry>, PostsError> {
        let handle = self.index.open().await?;
        let entries = handle.scan(cursor, limit, direction)?;
        handle.close();
        Ok(entries)
    }

    pub async fn get_posts_page(&self, page: usize) -> Result<Vec<PostEntry>, PostsError> {
        self.list_posts(page, self.config.posts_per_page).await
    }

    pub async fn total_pages(&self, page_size: usize) -> Result<usize, PostsError> {
        if page_size == 0 {
            return Ok(0);
        }
        let handle = self.index.open().await?;
        let count = handle.len()?;
        handle.close();
        Ok(usize::try_from(count).unwrap_or(usize::MAX).div_ceil(page_size))
    }

    pub async fn get_total_pages(&self) -> Result<usize, PostsError> {
        self.total_pages(self.config.posts_per_page).await
    }

    /// Regenerates the index from the post directories. Directories whose
    /// record cannot be read are left out and reported.
    pub async fn reload(&self) -> Result<RebuildReport, PostsError> {
        info!(
            "Rebuilding post index from directory: {:?}",
            self.config.source_directory
        );

        let (entries, skipped) = self.scan_tree().await?;

        let handle = self.index.open().await?;
        let indexed = handle.rebuild(&entries)?;
        handle.close();

        info!(
            "Rebuilt post index with {} posts ({} skipped)",
            indexed,
            skipped.len()
        );
        Ok(RebuildReport { indexed, skipped })
    }

    /// Compares the index against the post directories without changing
    /// either.
    pub async fn check_consistency(&self) -> Result<ConsistencyReport, PostsError> {
        let (entries, unreadable) = self.scan_tree().await?;

        let handle = self.index.open().await?;
        let indexed = handle.page(None, 0, usize::MAX, ScanDirection::OldestFirst)?;
        handle.close();

        let on_disk: BTreeSet<PostIdentity> = entries.into_iter().map(|e| e.identity).collect();
        let in_index: BTreeSet<PostIdentity> = indexed.into_iter().map(|e| e.identity).collect();
        // Unreadable directories are reported separately, not as orphans.
        let unreadable_slugs: BTreeSet<&str> =
            unreadable.iter().map(|s| s.slug.as_str()).collect();

        let report = ConsistencyReport {
            missing_from_index: on_disk.difference(&in_index).cloned().collect(),
            orphaned_entries: in_index
                .difference(&on_disk)
                .filter(|identity| !unreadable_slugs.contains(identity.slug.as_str()))
                .cloned()
                .collect(),
            unreadable,
        };

        if report.is_consistent() {
            debug!("Post index is consistent with {} posts", on_disk.len());
        } else {
            warn!(
                "Post index is inconsistent: {} missing, {} orphaned, {} unreadable",
                report.missing_from_index.len(),
                report.orphaned_entries.len(),
                report.unreadable.len()
            );
        }
        Ok(report)
    }

    fn projection(&self, record: &PostRecord) -> PostProjection {
        PostProjection {
            title: record.title.clone(),
            summary: record
                .summary
                .clone()
                .unwrap_or_else(|| summarize(&record.body, self.config.summary_max_chars)),
            image: record.image.clone(),
        }
    }

    /// Reads the record of an existing post, checking that it still carries
    /// the date of the identity the caller holds.
    async fn read_post(&self, identity: &PostIdentity) -> Result<(PathBuf, PostRecord), PostsError> {
        if !is_normalized(&identity.slug) {
            return Err(PostsError::PostNotFound(identity.to_string()));
        }

        let directory = self.tree.directory_for(&identity.slug);
        let record = codec::decode(&self.tree.read_record(&directory).await?)?;
        if record.date != identity.date {
            debug!(
                "Post {} exists with date {}, not {}",
                identity.slug, record.date, identity.date
            );
            return Err(PostsError::PostNotFound(identity.to_string()));
        }

        Ok((directory, record))
    }

    async fn scan_tree(&self) -> Result<(Vec<PostEntry>, Vec<SkippedPost>), PostsError> {
        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for (slug, directory) in self.tree.post_directories().await? {
            if !is_normalized(&slug) {
                warn!("Skipping post directory with unnormalized name {:?}", slug);
                skipped.push(SkippedPost {
                    slug,
                    reason: "directory name is not a normalized slug".to_string(),
                });
                continue;
            }

            let loaded = match self.tree.read_record(&directory).await {
                Ok(bytes) => codec::decode(&bytes),
                Err(e) => Err(e),
            };

            match loaded {
                Ok(record) => {
                    debug!("Loaded post: {}", slug);
                    entries.push(PostEntry {
                        projection: self.projection(&record),
                        identity: PostIdentity::new(record.date, slug),
                    });
                }
                Err(e) => {
                    warn!("Failed to load post {:?}: {}", directory, e);
                    skipped.push(SkippedPost {
                        slug,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok((entries, skipped))
    }
}

/// Short form of a body for listings: its first paragraph with whitespace
/// collapsed, cut to `max_chars` characters.
pub fn summarize(body: &str, max_chars: usize) -> String {
    let mut words = Vec::new();
    for line in body.lines() {
        if line.trim().is_empty() {
            if !words.is_empty() {
                break;
            }
            continue;
        }
        words.extend(line.split_whitespace());
    }

    let paragraph = words.join(" ");
    if paragraph.chars().count() <= max_chars {
        return paragraph;
    }

    let mut summary: String = paragraph.chars().take(max_chars).collect();
    summary.truncate(summary.trim_end().len());
    summary.push('…');
    summary
}
