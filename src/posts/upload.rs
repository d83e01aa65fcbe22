use super::{error::PostsError, tree::PostTree, types::Upload};
use std::path::{Component, Path};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};
use tracing::debug;

/// Rejects anything that is not a single plain file name.
pub fn validate_file_name(file_name: &str) -> Result<(), PostsError> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == file_name => Ok(()),
        _ => Err(PostsError::Validation(format!(
            "Invalid upload file name: {:?}",
            file_name
        ))),
    }
}

/// Streams an upload into `<post_directory>/uploads/<file_name>`, replacing
/// any existing file of that name. Returns once the data is flushed and
/// synced. A failed write leaves the partial file in place.
pub async fn write_upload(
    tree: &PostTree,
    post_directory: &Path,
    upload: Upload,
) -> Result<u64, PostsError> {
    validate_file_name(&upload.file_name)?;

    let uploads_directory = PostTree::uploads_directory(post_directory);
    tree.ensure_directory(&uploads_directory).await?;

    let path = uploads_directory.join(&upload.file_name);
    let Upload { mut reader, .. } = upload;

    let mut writer = BufWriter::new(File::create(&path).await?);
    let written = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    writer.get_ref().sync_all().await?;

    debug!("Wrote {} bytes to {:?}", written, path);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posts::error::ErrorKind;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("tacos.jpg").is_ok());
        assert!(validate_file_name("no extension").is_ok());

        for bad in ["", ".", "..", "../escape.jpg", "nested/file.png", "/abs.png", "trailing/"] {
            let err = validate_file_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_streams_chunks_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let tree = PostTree::new(temp_dir.path());
        let post_directory = tree.directory_for("pie");
        tree.create_directory(&post_directory).await.unwrap();

        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..64)
            .map(|i| Ok(Bytes::from(vec![i as u8; 1024])))
            .collect();
        let upload = Upload::from_stream("crust.png", futures::stream::iter(chunks));

        let written = write_upload(&tree, &post_directory, upload).await.unwrap();
        assert_eq!(written, 64 * 1024);

        let contents = std::fs::read(post_directory.join("uploads/crust.png")).unwrap();
        assert_eq!(contents.len(), 64 * 1024);
        assert_eq!(contents[1024], 1);
        assert_eq!(contents[64 * 1024 - 1], 63);
    }

    #[tokio::test]
    async fn test_overwrites_existing_upload() {
        let temp_dir = TempDir::new().unwrap();
        let tree = PostTree::new(temp_dir.path());
        let post_directory = tree.directory_for("pie");
        tree.create_directory(&post_directory).await.unwrap();

        write_upload(&tree, &post_directory, Upload::from_bytes("a.txt", "a longer first version"))
            .await
            .unwrap();
        write_upload(&tree, &post_directory, Upload::from_bytes("a.txt", "short"))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(post_directory.join("uploads/a.txt")).unwrap();
        assert_eq!(contents, "short");
    }

    #[tokio::test]
    async fn test_failed_stream_surfaces_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let tree = PostTree::new(temp_dir.path());
        let post_directory = tree.directory_for("pie");
        tree.create_directory(&post_directory).await.unwrap();

        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ];
        let upload = Upload::from_stream("broken.bin", futures::stream::iter(chunks));

        let err = write_upload(&tree, &post_directory, upload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(post_directory.join("uploads/broken.bin").exists());
    }
}
