//! Discharging third party caveats.
//!
//! A permission macaroon may carry third party caveats that are only
//! satisfied when it is presented together with a discharge macaroon from the
//! named authority. A [DischargeAuthority] decides whether a list of
//! macaroons is missing any discharges and obtains them; [ThirdPartyClient]
//! is the implementation that talks to the real authorities over HTTP.

mod client;
mod data;

pub use client::*;
pub use data::*;

use async_trait::async_trait;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

use crate::{
    macaroon::{Macaroon, ThirdPartyCaveat, LOCATION_PERMISSION},
    DischargeError, DischargeFailure,
};

/// Something that can supply discharge macaroons for a comma-separated list
/// of macaroon tokens
#[async_trait]
pub trait DischargeAuthority: Send + Sync {
    /// True if any third party caveat in `macaroons` lacks a discharge
    async fn needs_discharge(&self, macaroons: &str) -> Result<bool, DischargeError>;

    /// Return `macaroons` with a discharge added for every third party caveat
    /// that lacks one. On failure, [DischargeFailure::partial] holds the list
    /// with whatever discharges were obtained before the failure.
    async fn fetch_discharge_tokens(
        &self,
        cancel: &CancellationToken,
        macaroons: &str,
    ) -> Result<String, DischargeFailure>;
}

/// The third party caveats of the permission macaroons in `macaroons` that
/// have no unexpired discharge (as of `now`) in the same list. Each ticket is
/// reported once; undecodable tokens are ignored.
pub fn undischarged_caveats(macaroons: &str, now: u64) -> Vec<ThirdPartyCaveat> {
    let decoded: Vec<Macaroon> = macaroons
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| match Macaroon::decode(token) {
            Ok(macaroon) => Some(macaroon),
            Err(error) => {
                trace!("Ignoring undecodable macaroon: {}", error);
                None
            }
        })
        .collect();

    let discharged: HashSet<&str> = decoded
        .iter()
        .filter(|macaroon| macaroon.location != LOCATION_PERMISSION && !macaroon.is_expired(now))
        .map(|macaroon| macaroon.ticket())
        .collect();

    let mut seen = HashSet::new();

    decoded
        .iter()
        .filter(|macaroon| macaroon.location == LOCATION_PERMISSION)
        .flat_map(|macaroon| macaroon.third_party_caveats())
        .filter(|caveat| !discharged.contains(caveat.ticket.as_str()))
        .filter(|caveat| seen.insert(caveat.ticket.clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        helpers::{discharge_for, permission_token},
        macaroon::{LOCATION_AUTHENTICATION, LOCATION_NEW_AUTHENTICATION},
    };
    use anyhow::Result;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn it_finds_caveats_without_a_live_discharge() -> Result<()> {
        let permission = permission_token(
            NOW + 3_600,
            &[
                (LOCATION_AUTHENTICATION, "t1"),
                (LOCATION_NEW_AUTHENTICATION, "t2"),
                ("https://example.com/3p", "t3"),
            ],
        )?;
        let live = discharge_for(LOCATION_AUTHENTICATION, "t1", NOW + 3_600)?;
        let expired = discharge_for(LOCATION_NEW_AUTHENTICATION, "t2", NOW - 1)?;

        let caveats = undischarged_caveats(&format!("{permission},{live},{expired}"), NOW);

        assert_eq!(
            caveats
                .iter()
                .map(|caveat| caveat.ticket.as_str())
                .collect::<Vec<_>>(),
            vec!["t2", "t3"]
        );
        Ok(())
    }

    #[test]
    fn it_reports_each_ticket_once() -> Result<()> {
        let first = permission_token(NOW + 3_600, &[(LOCATION_AUTHENTICATION, "t1")])?;
        let second = permission_token(NOW + 7_200, &[(LOCATION_AUTHENTICATION, "t1")])?;

        assert_eq!(
            undischarged_caveats(&format!("{first},{second},fm2_junk"), NOW).len(),
            1
        );
        assert!(undischarged_caveats("", NOW).is_empty());
        Ok(())
    }
}
