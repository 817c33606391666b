//! Template variable substitution. `{{name}}` resolves to the recipient's
//! name (falling back to the phone), `{{phone}}` to the phone; any extra
//! variables come from the template's variable map.

use std::collections::HashMap;

use wagate_common::models::BroadcastRecipient;

pub fn render(
    text: &str,
    recipient: &BroadcastRecipient,
    variables: Option<&HashMap<String, String>>,
) -> String {
    let name = recipient
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| recipient.phone_number.clone());
    let mut out = text
        .replace("{{name}}", &name)
        .replace("{{phone}}", &recipient.phone_number);
    if let Some(vars) = variables {
        for (key, value) in vars {
            out = out.replace(&format!("{{{{{}}}}}", key), value);
        }
    }
    out
}
