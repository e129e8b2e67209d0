//! Endpoint addresses: `"<poName>.<mailboxName>"`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{CENTRAL_NAME, MANAGEMENT_MAILBOX, error::ProtocolError};

/// A fully-qualified mailbox address.
///
/// Both components are non-empty and contain no `.`; the dot between them is
/// the only dot in the rendered form. Addresses are cheap to clone and hash;
/// subscription sets and routing tables key on them directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    po: String,
    mailbox: String,
}

impl Address {
    /// Build an address from its two components, validating each.
    pub fn new(po: &str, mailbox: &str) -> Result<Self, ProtocolError> {
        let invalid = |reason| ProtocolError::InvalidAddress {
            address: format!("{po}.{mailbox}"),
            reason,
        };
        if po.is_empty() {
            return Err(invalid("post office name is empty"));
        }
        if po.contains('.') {
            return Err(invalid("post office name contains '.'"));
        }
        if mailbox.is_empty() {
            return Err(invalid("mailbox name is empty"));
        }
        if mailbox.contains('.') {
            return Err(invalid("mailbox name contains '.'"));
        }
        Ok(Self { po: po.to_string(), mailbox: mailbox.to_string() })
    }

    /// The management mailbox (`po`) of the named post office.
    pub fn management(po: &str) -> Result<Self, ProtocolError> {
        Self::new(po, MANAGEMENT_MAILBOX)
    }

    /// The central post office's management mailbox, `central.po`.
    pub fn central_management() -> Self {
        Self {
            po: CENTRAL_NAME.to_string(),
            mailbox: MANAGEMENT_MAILBOX.to_string(),
        }
    }

    /// Post office component.
    pub fn po(&self) -> &str {
        &self.po
    }

    /// Mailbox component.
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Whether this is a post office's reserved management mailbox.
    pub fn is_management(&self) -> bool {
        self.mailbox == MANAGEMENT_MAILBOX
    }

    /// Whether this is the central post office's management mailbox.
    pub fn is_central_management(&self) -> bool {
        self.po == CENTRAL_NAME && self.is_management()
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let Some((po, mailbox)) = text.split_once('.') else {
            return Err(ProtocolError::InvalidAddress {
                address: text.to_string(),
                reason: "expected '<poName>.<mailboxName>'",
            });
        };
        Self::new(po, mailbox)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.po, self.mailbox)
    }
}

impl TryFrom<String> for Address {
    type Error = ProtocolError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}
