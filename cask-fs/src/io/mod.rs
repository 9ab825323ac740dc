pub(crate) mod archive;
pub(crate) mod array_file;

pub(crate) use self::archive::{write_archive, ArchiveReader};
pub(crate) use self::array_file::{
    encode_array,
    read_array_heap,
    read_array_mapped,
    validate_array_bytes,
    write_array,
};
