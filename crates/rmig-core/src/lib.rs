pub mod contracts;
pub mod keys;
pub mod pagination;

pub use contracts::*;
pub use keys::KeyAllocator;
pub use pagination::{PageReport, PageRequest, Pagination, PaginationMode};
