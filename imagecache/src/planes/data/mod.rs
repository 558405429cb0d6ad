mod items;
pub mod path_storage;
pub mod result_storage;

pub use path_storage::PathStorage;
pub use result_storage::ResultStorage;
