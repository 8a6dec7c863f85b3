//! The object-keys segment.
//!
//! A textual dump of the field-name interner so the VM can reflect field
//! IDs back into names: one `name=id` line per registered field, in ID
//! order.

use crate::interner::FieldInterner;

/// Render the interner as the object-keys blob.
pub fn render_object_keys(interner: &FieldInterner) -> Vec<u8> {
    let mut out = String::new();
    for (id, name) in interner.iter() {
        out.push_str(name);
        out.push('=');
        out.push_str(&id.to_string());
        out.push('\n');
    }
    out.into_bytes()
}
