//! Builders for the non-code segments of the image.
//!
//! Four segments accumulate while functions are compiled: the constant
//! pool, the global-variable table, the template descriptors for structs
//! and classes, and the object-keys blob that lets the VM map field IDs
//! back to names. The linker concatenates them with the code segment into
//! the final image.

pub mod constants;
pub mod globals;
pub mod keys;
pub mod templates;

pub use self::constants::ConstantPool;
pub use self::globals::GlobalTable;
pub use self::keys::render_object_keys;
pub use self::templates::TemplateBuilder;
