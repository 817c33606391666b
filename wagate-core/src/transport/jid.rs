//! JID handling. The network addresses peers in two identifier spaces: the
//! classical phone-form JID (`<digits>@s.whatsapp.net`) and the Linked
//! Identity form (`<opaque digits>@lid`). Replies always thread the
//! original remote JID; identity extraction is best-effort.

use crate::util::phone;

const USER_SUFFIX: &str = "@s.whatsapp.net";
const GROUP_SUFFIX: &str = "@g.us";
const LID_SUFFIX: &str = "@lid";

/// Sum type over the two identifier spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Phone(String),
    Lid(String),
}

impl Identity {
    /// The phone number, when this identity lives in phone space.
    pub fn phone(&self) -> Option<&str> {
        match self {
            Identity::Phone(p) => Some(p),
            Identity::Lid(_) => None,
        }
    }

    /// Stable storage key: the phone, or a `LID_<digits>` pseudo-identifier
    /// for unresolved linked identities.
    pub fn storage_key(&self) -> String {
        match self {
            Identity::Phone(p) => p.clone(),
            Identity::Lid(l) => format!("LID_{}", l),
        }
    }

    pub fn is_lid(&self) -> bool {
        matches!(self, Identity::Lid(_))
    }
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX)
}

pub fn is_lid_jid(jid: &str) -> bool {
    jid.ends_with(LID_SUFFIX)
}

/// Classify a user-space JID. Besides the explicit `@lid` suffix, a bare
/// identifier is treated as a LID when it is implausibly long for a phone
/// number and does not carry a known country-code shape.
pub fn identify(jid: &str) -> Identity {
    let local = jid.split('@').next().unwrap_or(jid);
    let digits: String = local.chars().filter(|c| c.is_ascii_digit()).collect();

    if is_lid_jid(jid) {
        return Identity::Lid(digits);
    }
    if digits.len() > 15 {
        return Identity::Lid(digits);
    }
    Identity::Phone(phone::normalize(&digits))
}

/// Extract a normalized phone from a JID when it is phone-form.
pub fn phone_from_jid(jid: &str) -> Option<String> {
    match identify(jid) {
        Identity::Phone(p) if phone::is_plausible(&p) => Some(p),
        _ => None,
    }
}

/// Build a sendable user JID from a normalized phone number.
pub fn jid_from_phone(phone: &str) -> String {
    format!("{}{}", phone, USER_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_phone_jids() {
        assert_eq!(
            identify("6281234567890@s.whatsapp.net"),
            Identity::Phone("6281234567890".into())
        );
        assert_eq!(
            phone_from_jid("6281234567890@s.whatsapp.net"),
            Some("6281234567890".into())
        );
    }

    #[test]
    fn classifies_lid_jids() {
        let id = identify("123456789012345678@lid");
        assert!(id.is_lid());
        assert_eq!(id.storage_key(), "LID_123456789012345678");
        assert_eq!(phone_from_jid("123456789012345678@lid"), None);
    }

    #[test]
    fn long_bare_identifiers_are_lids() {
        assert!(identify("9876543210987654321@s.whatsapp.net").is_lid());
    }

    #[test]
    fn group_jid_detection() {
        assert!(is_group_jid("120363025246125486@g.us"));
        assert!(!is_group_jid("6281234567890@s.whatsapp.net"));
    }

    #[test]
    fn jid_round_trip() {
        let jid = jid_from_phone("6281234567890");
        assert_eq!(phone_from_jid(&jid), Some("6281234567890".into()));
    }
}
