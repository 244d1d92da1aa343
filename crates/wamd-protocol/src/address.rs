//! Peer address resolution.
//!
//! The platform keeps two parallel identity systems: phone-number
//! identifiers (`5521987908324@s.whatsapp.net`, optionally with a
//! `.device` suffix on the user part) and anonymized identifiers
//! (`188480915300534@lid`). An address in one namespace is never
//! equivalent to a same-looking address in the other, so every
//! canonical string used as a storage key is produced here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Domain of phone-number identifiers.
pub const S_WHATSAPP_NET: &str = "s.whatsapp.net";

/// Domain of anonymized identifiers.
pub const LID_DOMAIN: &str = "lid";

/// Which identity system an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    PhoneIdentifier,
    AnonymizedIdentifier,
}

impl Namespace {
    pub fn domain(self) -> &'static str {
        match self {
            Namespace::PhoneIdentifier => S_WHATSAPP_NET,
            Namespace::AnonymizedIdentifier => LID_DOMAIN,
        }
    }

    pub fn is_anonymized(self) -> bool {
        self == Namespace::AnonymizedIdentifier
    }
}

/// Domain a protocol request should target.
pub fn domain_for(use_anonymized: bool) -> &'static str {
    if use_anonymized {
        LID_DOMAIN
    } else {
        S_WHATSAPP_NET
    }
}

/// True if the identifier carries the anonymized-identifier domain suffix.
pub fn is_lid_identifier(identifier: &str) -> bool {
    identifier.ends_with("@lid")
}

/// The part after `@`, or an empty string when there is none.
pub fn identifier_domain(identifier: &str) -> &str {
    identifier.split_once('@').map_or("", |(_, domain)| domain)
}

/// Namespace an identifier string would resolve into.
pub fn namespace_of(identifier: &str) -> Namespace {
    if is_lid_identifier(identifier) {
        Namespace::AnonymizedIdentifier
    } else {
        Namespace::PhoneIdentifier
    }
}

/// A resolved peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub user: String,
    pub device: u32,
    pub namespace: Namespace,
}

impl Address {
    pub fn new(user: impl Into<String>, device: u32, namespace: Namespace) -> Self {
        Self {
            user: user.into(),
            device,
            namespace,
        }
    }

    pub fn phone(user: impl Into<String>, device: u32) -> Self {
        Self::new(user, device, Namespace::PhoneIdentifier)
    }

    pub fn lid(user: impl Into<String>) -> Self {
        Self::new(user, 0, Namespace::AnonymizedIdentifier)
    }

    /// Same user and namespace, different device.
    pub fn with_device(&self, device: u32) -> Self {
        Self {
            user: self.user.clone(),
            device,
            namespace: self.namespace,
        }
    }

    /// Identifier string as exchanged on the wire.
    pub fn to_identifier(&self) -> String {
        format(&self.user, self.namespace, self.device)
    }

    /// Canonical address string, the storage key of this peer's session.
    ///
    /// Always `user.device@domain`: the device is kept even for anonymized
    /// addresses and the domain keeps the two namespaces apart.
    pub fn signal_key(&self) -> String {
        format!("{}.{}@{}", self.user, self.device, self.namespace.domain())
    }

    /// Name half of the primitive library's protocol address (`user@domain`).
    pub fn protocol_name(&self) -> String {
        format!("{}@{}", self.user, self.namespace.domain())
    }

    /// Rebuild an address from a protocol-address name and device id.
    pub fn from_protocol_parts(name: &str, device: u32) -> Result<Self, AddressError> {
        parse(name).map(|address| address.with_device(device))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_identifier())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse an identifier string into an [`Address`].
pub fn parse(identifier: &str) -> Result<Address, AddressError> {
    let (user_part, domain) = identifier
        .split_once('@')
        .ok_or_else(|| AddressError::MissingDomain(identifier.to_string()))?;

    match domain {
        LID_DOMAIN => {
            check_user(identifier, user_part)?;
            Ok(Address::lid(user_part))
        }
        S_WHATSAPP_NET => {
            let (user, device) = match user_part.split_once('.') {
                Some((user, device)) => {
                    let device = device.parse::<u32>().map_err(|_| AddressError::InvalidDevice {
                        identifier: identifier.to_string(),
                        device: device.to_string(),
                    })?;
                    (user, device)
                }
                None => (user_part, 0),
            };
            check_user(identifier, user)?;
            Ok(Address::phone(user, device))
        }
        _ => Err(AddressError::UnknownDomain {
            identifier: identifier.to_string(),
            domain: domain.to_string(),
        }),
    }
}

/// Storage keys are derived from the user part, so separators other parts
/// of an identifier use are not allowed in it.
fn check_user(identifier: &str, user: &str) -> Result<(), AddressError> {
    if user.is_empty() {
        return Err(AddressError::EmptyUser(identifier.to_string()));
    }
    if user.contains([':', '/', '@']) {
        return Err(AddressError::InvalidUser {
            identifier: identifier.to_string(),
            user: user.to_string(),
        });
    }
    Ok(())
}

/// Format a user into an identifier of the given namespace.
///
/// Anonymized identifiers cannot carry a device, so `device` is ignored for them.
pub fn format(user: &str, namespace: Namespace, device: u32) -> String {
    match namespace {
        Namespace::AnonymizedIdentifier => format!("{user}@{LID_DOMAIN}"),
        Namespace::PhoneIdentifier if device == 0 => format!("{user}@{S_WHATSAPP_NET}"),
        Namespace::PhoneIdentifier => format!("{user}.{device}@{S_WHATSAPP_NET}"),
    }
}
