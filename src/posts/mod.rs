pub mod codec;
pub mod core;
pub mod error;
pub mod index;
pub mod slug;
pub mod tree;
pub mod types;
pub mod upload;

pub use self::core::{PostsManager, summarize};
pub use error::{ErrorKind, PostsError};
pub use index::{ChronologicalIndex, IndexHandle};
pub use slug::slugify;
pub use tree::PostTree;
pub use types::{
    ConsistencyReport, CreatePostInput, Post, PostEntry, PostIdentity, PostProjection,
    PostRecord, PostsConfig, RebuildReport, ScanDirection, SkippedPost, UpdatePostInput, Upload,
    parse_timestamp,
};
