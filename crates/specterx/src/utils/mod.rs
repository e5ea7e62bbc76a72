//! Small shared helpers.

#[cfg(windows)]
pub mod handle;
pub mod path;
pub mod strings;

#[cfg(windows)]
use winapi::shared::ntdef::{OBJECT_ATTRIBUTES, PUNICODE_STRING};

/// Builds object attributes for a native open call.
#[cfg(windows)]
pub(crate) fn object_attributes(name: PUNICODE_STRING, attributes: u32) -> OBJECT_ATTRIBUTES {
    OBJECT_ATTRIBUTES {
        Length: core::mem::size_of::<OBJECT_ATTRIBUTES>() as u32,
        RootDirectory: core::ptr::null_mut(),
        ObjectName: name,
        Attributes: attributes,
        SecurityDescriptor: core::ptr::null_mut(),
        SecurityQualityOfService: core::ptr::null_mut(),
    }
}
