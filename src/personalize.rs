use crate::model::Recipient;

/// Substitute `{{key}}` placeholders in a template with recipient fields.
///
/// The reserved key `name` maps to the recipient's display name; every
/// other key is looked up in the recipient's metadata. Placeholders with
/// no matching key are left verbatim. Applied independently to subject
/// and body by the dispatch engine.
pub fn render(template: &str, recipient: &Recipient) -> String {
    let mut out = template.to_string();
    if let Some(name) = &recipient.name {
        out = out.replace("{{name}}", name);
    }
    for (key, value) in &recipient.metadata {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}
