mod access;
mod file;
mod realm;

pub use access::Access;
pub use file::{File, FileId, Flags};
pub use realm::{Realm, RealmPolicy};

pub(crate) use file::{clean_name, join_name, split_name, strip_version, FileQuery};
