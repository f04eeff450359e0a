//! A decoded view of fly.io macaroon tokens.
//!
//! Macaroons travel as `<prefix>_<payload>`, where the prefix is one of
//! [MACAROON_PREFIXES] and the payload is the URL-safe (unpadded) base64
//! encoding of the JSON body described by [Macaroon]. Nothing here verifies
//! the signature in `tail`: clients only ever inspect caveats to decide what
//! to prune and what to discharge, and the issuing services do the verifying.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::TryFrom;

use crate::MacaroonError;

/// The macaroon prefixes that are recognized, in addition to being followed by
/// an underscore
pub const MACAROON_PREFIXES: &[&str] = &["fm1r", "fm1a", "fm2"];

/// The prefix used when encoding new macaroons
pub const DEFAULT_MACAROON_PREFIX: &str = "fm2";

/// Macaroons issued by the permission service; these carry the third party
/// caveats that other tokens are discharges for
pub const LOCATION_PERMISSION: &str = "https://api.fly.io/v1";
/// Discharge tokens issued by the (legacy) authentication service
pub const LOCATION_AUTHENTICATION: &str = "https://api.fly.io/aaa/v1";
/// Discharge tokens issued by the authentication service
pub const LOCATION_NEW_AUTHENTICATION: &str = "https://auth.fly.io";
/// Macaroons issued by the secrets service
pub const LOCATION_SECRETS: &str = "https://api.fly.io/secrets/v1";

/// Returns true if the token carries one of the [MACAROON_PREFIXES]
pub fn is_macaroon(token: &str) -> bool {
    match token.split_once('_') {
        Some((prefix, _)) => MACAROON_PREFIXES.contains(&prefix),
        None => false,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    /// The key id; for a discharge token this is the ticket of the third
    /// party caveat it discharges
    pub kid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rnd: String,
}

/// Bounds (in seconds since the UNIX epoch) on when a macaroon may be used
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub not_before: u64,
    pub not_after: u64,
}

/// A caveat that may only be satisfied by a discharge token from the
/// authority at `location`, correlated by `ticket`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdPartyCaveat {
    pub location: String,
    pub ticket: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCaveat", into = "RawCaveat")]
pub enum Caveat {
    ValidityWindow(ValidityWindow),
    ThirdParty(ThirdPartyCaveat),
    /// Any caveat this client does not need to understand
    Other {
        name: String,
        fields: Map<String, Value>,
    },
}

const VALIDITY_WINDOW: &str = "ValidityWindow";
const THIRD_PARTY: &str = "3P";

impl Caveat {
    pub fn name(&self) -> &str {
        match self {
            Caveat::ValidityWindow(_) => VALIDITY_WINDOW,
            Caveat::ThirdParty(_) => THIRD_PARTY,
            Caveat::Other { name, .. } => name,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawCaveat {
    #[serde(rename = "type")]
    name: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl TryFrom<RawCaveat> for Caveat {
    type Error = serde_json::Error;

    fn try_from(raw: RawCaveat) -> Result<Self, Self::Error> {
        Ok(match raw.name.as_str() {
            VALIDITY_WINDOW => {
                Caveat::ValidityWindow(serde_json::from_value(Value::Object(raw.fields))?)
            }
            THIRD_PARTY => Caveat::ThirdParty(serde_json::from_value(Value::Object(raw.fields))?),
            _ => Caveat::Other {
                name: raw.name,
                fields: raw.fields,
            },
        })
    }
}

impl From<Caveat> for RawCaveat {
    fn from(caveat: Caveat) -> Self {
        let name = caveat.name().to_owned();
        let fields = match caveat {
            Caveat::ValidityWindow(window) => object_fields(serde_json::to_value(window)),
            Caveat::ThirdParty(third_party) => object_fields(serde_json::to_value(third_party)),
            Caveat::Other { fields, .. } => fields,
        };
        RawCaveat { name, fields }
    }
}

fn object_fields(value: Result<Value, serde_json::Error>) -> Map<String, Value> {
    match value {
        Ok(Value::Object(fields)) => fields,
        _ => Map::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Macaroon {
    pub nonce: Nonce,
    /// The authority that issued this macaroon
    pub location: String,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tail: String,
}

impl Macaroon {
    pub fn new(location: &str, kid: &str) -> Self {
        Macaroon {
            nonce: Nonce {
                kid: kid.to_owned(),
                rnd: String::new(),
            },
            location: location.to_owned(),
            caveats: Vec::new(),
            tail: String::new(),
        }
    }

    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.caveats.push(caveat);
        self
    }

    pub fn with_validity(self, not_before: u64, not_after: u64) -> Self {
        self.with_caveat(Caveat::ValidityWindow(ValidityWindow {
            not_before,
            not_after,
        }))
    }

    pub fn with_third_party(self, location: &str, ticket: &str) -> Self {
        self.with_caveat(Caveat::ThirdParty(ThirdPartyCaveat {
            location: location.to_owned(),
            ticket: ticket.to_owned(),
        }))
    }

    /// Decode a single prefixed macaroon token
    pub fn decode(token: &str) -> Result<Self, MacaroonError> {
        let payload = match token.trim().split_once('_') {
            Some((prefix, payload)) if MACAROON_PREFIXES.contains(&prefix) => payload,
            _ => return Err(MacaroonError::UnrecognizedPrefix),
        };
        let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Encode this macaroon as a token carrying the [DEFAULT_MACAROON_PREFIX]
    pub fn encode(&self) -> Result<String, MacaroonError> {
        let body = serde_json::to_vec(self)?;
        Ok(format!(
            "{}_{}",
            DEFAULT_MACAROON_PREFIX,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body)
        ))
    }

    /// The id that a discharge token is correlated by
    pub fn ticket(&self) -> &str {
        &self.nonce.kid
    }

    /// The earliest `not_after` of all validity windows; `None` if this
    /// macaroon never expires
    pub fn expiration(&self) -> Option<u64> {
        self.caveats
            .iter()
            .filter_map(|caveat| match caveat {
                Caveat::ValidityWindow(window) => Some(window.not_after),
                _ => None,
            })
            .min()
    }

    /// A macaroon is usable only while `now` is before its expiration
    pub fn is_expired(&self, now: u64) -> bool {
        match self.expiration() {
            Some(expiration) => now >= expiration,
            None => false,
        }
    }

    pub fn third_party_caveats(&self) -> impl Iterator<Item = &ThirdPartyCaveat> {
        self.caveats.iter().filter_map(|caveat| match caveat {
            Caveat::ThirdParty(third_party) => Some(third_party),
            _ => None,
        })
    }

    pub fn caveat_names(&self) -> Vec<String> {
        self.caveats
            .iter()
            .map(|caveat| caveat.name().to_owned())
            .collect()
    }

    /// Discharge tokens issued by an authentication service are the ones that
    /// get retired ahead of their expiration
    pub fn is_authentication(&self) -> bool {
        self.location == LOCATION_AUTHENTICATION || self.location == LOCATION_NEW_AUTHENTICATION
    }
}
