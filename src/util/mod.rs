pub mod address;
pub mod bitmap;
pub mod constants;
pub mod logger;
pub mod memory;
pub mod options;

pub use self::address::Address;
pub use self::address::ObjectReference;
