use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use crate::{
    macaroon::{Macaroon, LOCATION_PERMISSION},
    Tokens,
};

impl Tokens {
    /// Remove macaroons that can no longer be used: those that fail to decode
    /// or have expired as of `now` (seconds since the UNIX epoch), discharge
    /// tokens for third party caveats that no live permission token carries
    /// any more, and authentication discharges that expire within `advance`
    /// of `now`. Returns true if anything was removed.
    pub fn prune(&self, now: u64, advance: Duration) -> bool {
        let mut buckets = self.buckets.write();

        let mut tickets = HashSet::new();
        let mut decoded = HashMap::new();

        for token in buckets.macaroons.iter() {
            let macaroon = match Macaroon::decode(token) {
                Ok(macaroon) => macaroon,
                Err(error) => {
                    debug!("Dropping undecodable macaroon: {}", error);
                    continue;
                }
            };

            if macaroon.is_expired(now) {
                debug!("Dropping expired macaroon from {}", macaroon.location);
                continue;
            }

            if macaroon.location == LOCATION_PERMISSION {
                for caveat in macaroon.third_party_caveats() {
                    tickets.insert(caveat.ticket.clone());
                }
            }

            decoded.insert(token.clone(), macaroon);
        }

        let horizon = now.saturating_add(advance.as_secs());
        let before = buckets.macaroons.len();

        buckets.macaroons.retain(|token| {
            let Some(macaroon) = decoded.get(token) else {
                return false;
            };

            if macaroon.location == LOCATION_PERMISSION {
                return true;
            }

            if !tickets.contains(macaroon.ticket()) {
                debug!(
                    "Dropping discharge from {} that no caveat needs",
                    macaroon.location
                );
                return false;
            }

            if macaroon.is_authentication() && macaroon.is_expired(horizon) {
                debug!(
                    "Dropping discharge from {} ahead of its expiration",
                    macaroon.location
                );
                return false;
            }

            true
        });

        buckets.macaroons.len() != before
    }
}
