//! Client classification. A class is a named predicate evaluated against
//! the parsed query; matched class names gate subnets, pools, and
//! reservations.
use proto::v4::{DhcpOption, Message, OptionCode};

use crate::wire;

/// one configured class
#[derive(Debug, Clone)]
pub struct ClassDef {
    name: String,
    /// match when option 60 contains this substring
    vendor_substring: Option<Vec<u8>>,
}

impl ClassDef {
    pub(crate) fn from_wire(class: &wire::ClientClass) -> Self {
        ClassDef {
            name: class.name.clone(),
            vendor_substring: class
                .vendor_class_substring
                .as_ref()
                .map(|s| s.as_bytes().to_vec()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, msg: &Message) -> bool {
        match &self.vendor_substring {
            Some(needle) => match msg.opts().get(OptionCode::ClassIdentifier) {
                Some(DhcpOption::ClassIdentifier(vendor)) => contains(vendor, needle),
                _ => false,
            },
            // a class with no test never matches implicitly
            None => false,
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|win| win == needle)
}

/// evaluate every configured class against a query
pub fn classify(classes: &[ClassDef], msg: &Message) -> Vec<String> {
    classes
        .iter()
        .filter(|class| class.matches(msg))
        .map(|class| class.name().to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn class(name: &str, needle: &str) -> ClassDef {
        ClassDef {
            name: name.to_owned(),
            vendor_substring: Some(needle.as_bytes().to_vec()),
        }
    }

    #[test]
    fn vendor_substring_match() {
        let uns = Ipv4Addr::UNSPECIFIED;
        let mut msg = Message::new(uns, uns, uns, uns, &[1, 2, 3, 4, 5, 6]);
        msg.opts_mut()
            .insert(DhcpOption::ClassIdentifier(b"PRNT-laser-9000".to_vec()));

        let classes = [class("printers", "PRNT"), class("cameras", "CAM")];
        assert_eq!(classify(&classes, &msg), vec!["printers".to_owned()]);

        // no option 60 at all
        let bare = Message::new(uns, uns, uns, uns, &[1, 2, 3, 4, 5, 6]);
        assert!(classify(&classes, &bare).is_empty());
    }
}
