//! On-disk storage for cask column stores.
//!
//! Stores are laid out as a directory holding one directory per column,
//! each with up to three array files, plus an optional category index file.
//! Columns, or whole stores, may also be packed into zstd compressed archives.
//! Array files are memory mapped when loaded, archives are always read onto
//! the heap.

mod compress;
mod concat;
mod config;
mod error;
mod io;
mod paths;
mod store;

pub use self::compress::{compress, decompress};
pub use self::concat::{concatenate_and_index, ConcatReport};
pub use self::config::{
    CompressOptions,
    ConcatOptions,
    DecompressOptions,
    LoadOptions,
    DEFAULT_COMPRESSION_LEVEL,
};
pub use self::error::StoreError;
pub use self::paths::{is_column_dir, ARCHIVE_EXT, ARRAY_EXT, CATEGORY_SUFFIX};
pub use self::store::{
    add_column,
    list_columns,
    load,
    load_category_index,
    save_category_index,
    save_column,
    save_set,
    LoadedStore,
};
