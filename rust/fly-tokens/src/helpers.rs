//! Helpers for minting tokens and standing in for discharge authorities in
//! tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    discharge::DischargeAuthority,
    macaroon::{Macaroon, LOCATION_PERMISSION},
    Debugger, DischargeError, DischargeFailure, MacaroonError,
};

/// Mint a permission macaroon that expires at `not_after` and carries a third
/// party caveat for each `(location, ticket)` pair
pub fn permission_token(
    not_after: u64,
    third_parties: &[(&str, &str)],
) -> Result<String, MacaroonError> {
    let mut macaroon = Macaroon::new(LOCATION_PERMISSION, "permission").with_validity(0, not_after);
    for (location, ticket) in third_parties {
        macaroon = macaroon.with_third_party(location, ticket);
    }
    macaroon.encode()
}

/// Mint a discharge macaroon from `location` for the caveat with `ticket`
pub fn discharge_for(location: &str, ticket: &str, not_after: u64) -> Result<String, MacaroonError> {
    Macaroon::new(location, ticket)
        .with_validity(0, not_after)
        .encode()
}

/// A [Debugger] that keeps every message
#[derive(Clone, Default)]
pub struct RecordingDebugger {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingDebugger {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl Debugger for RecordingDebugger {
    fn debug(&self, message: &str) {
        self.messages.lock().push(message.to_owned());
    }
}

enum Outcome {
    Succeed(String),
    Fail(Option<String>, DischargeError),
    Hang,
}

/// A [DischargeAuthority] that replies with a fixed outcome
#[derive(Clone)]
pub struct ScriptedAuthority {
    needs_discharge: bool,
    outcome: Arc<Mutex<Option<Outcome>>>,
    fetches: Arc<AtomicU32>,
}

impl ScriptedAuthority {
    fn new(needs_discharge: bool) -> Self {
        ScriptedAuthority {
            needs_discharge,
            outcome: Arc::new(Mutex::new(None)),
            fetches: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Reports that nothing needs discharging
    pub fn satisfied() -> Self {
        Self::new(false)
    }

    /// Reports that discharges are needed; fetching fails unless an outcome
    /// is scripted
    pub fn needing_discharge() -> Self {
        Self::new(true)
    }

    pub fn succeeding_with(self, discharged: &str) -> Self {
        *self.outcome.lock() = Some(Outcome::Succeed(discharged.to_owned()));
        self
    }

    pub fn failing_with(self, partial: Option<&str>, error: DischargeError) -> Self {
        *self.outcome.lock() = Some(Outcome::Fail(partial.map(str::to_owned), error));
        self
    }

    /// Fetching waits until it is cancelled
    pub fn hanging(self) -> Self {
        *self.outcome.lock() = Some(Outcome::Hang);
        self
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DischargeAuthority for ScriptedAuthority {
    async fn needs_discharge(&self, _macaroons: &str) -> Result<bool, DischargeError> {
        Ok(self.needs_discharge)
    }

    async fn fetch_discharge_tokens(
        &self,
        cancel: &CancellationToken,
        _macaroons: &str,
    ) -> Result<String, DischargeFailure> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let outcome = self.outcome.lock().take();
        match outcome {
            Some(Outcome::Succeed(discharged)) => Ok(discharged),
            Some(Outcome::Fail(partial, error)) => Err(DischargeFailure { partial, error }),
            Some(Outcome::Hang) => {
                cancel.cancelled().await;
                Err(DischargeError::Cancelled.into())
            }
            None => Err(DischargeError::Other(anyhow::anyhow!("No outcome scripted")).into()),
        }
    }
}
