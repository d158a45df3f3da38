//! # Bucket Pointers
//!
//! A bucket pointer addresses one tree node: the page that hosts it and the
//! byte offset of its region within that page. Trees hand these out as stable
//! identities — the root pointer of a tree never changes for the tree's
//! lifetime, even across root splits.

use crate::config::ROOT_BUCKET_OFFSET;

/// Address of a bucket region inside a paginated file.
///
/// Pointers compare only for equality; there is no meaningful order between
/// two pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketPointer {
    page_index: i64,
    page_offset: u32,
}

impl BucketPointer {
    /// Sentinel for "no bucket". Leaf sibling chains terminate with it.
    pub const NULL: BucketPointer = BucketPointer {
        page_index: -1,
        page_offset: 0,
    };

    pub fn new(page_index: i64, page_offset: u32) -> Self {
        Self {
            page_index,
            page_offset,
        }
    }

    /// Pointer to the conventional region of a freshly allocated page.
    pub fn for_new_page(page_index: u64) -> Self {
        Self::new(page_index as i64, ROOT_BUCKET_OFFSET)
    }

    pub fn page_index(&self) -> i64 {
        self.page_index
    }

    pub fn page_offset(&self) -> u32 {
        self.page_offset
    }

    pub fn is_valid(&self) -> bool {
        self.page_index >= 0
    }
}
