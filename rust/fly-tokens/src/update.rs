use fly_common::{system_clock, BackoffPolicy, SharedClock};
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    discharge::{user_url_callback, DischargeAuthority, ThirdPartyClient, UserUrlCallback},
    macaroon::LOCATION_AUTHENTICATION,
    Debugger, DischargeError, DischargeFailure, NoopDebugger, Tokens, UpdateError,
};

/// The default margin by which authentication discharges are retired before
/// they expire
pub const DEFAULT_ADVANCE_PRUNE: Duration = Duration::from_secs(60);

/// The default bound on a single discharge exchange
pub const DEFAULT_DISCHARGE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an interrupted exchange gets to hand back what it had obtained
const SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Host that user tokens are presented to when discharging
const AUTH_HOST: &str = "auth.fly.io";

/// Options that govern a call to [Tokens::update]
#[derive(Clone)]
pub struct UpdateOptions {
    user_url_callback: Option<UserUrlCallback>,
    debugger: Arc<dyn Debugger>,
    advance_prune: Duration,
    discharge_timeout: Duration,
    authority: Option<Arc<dyn DischargeAuthority>>,
    clock: SharedClock,
    poll_policy: Option<BackoffPolicy>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            user_url_callback: None,
            debugger: Arc::new(NoopDebugger),
            advance_prune: DEFAULT_ADVANCE_PRUNE,
            discharge_timeout: DEFAULT_DISCHARGE_TIMEOUT,
            authority: None,
            clock: system_clock(),
            poll_policy: None,
        }
    }
}

impl UpdateOptions {
    /// Called with a URL the user must visit when a third party requires
    /// interactive authentication. The callback should give up once its
    /// token is cancelled.
    pub fn with_user_url_callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(CancellationToken, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.user_url_callback = Some(user_url_callback(callback));
        self
    }

    pub fn with_debugger<D: Debugger + 'static>(mut self, debugger: D) -> Self {
        self.debugger = Arc::new(debugger);
        self
    }

    pub fn with_advance_prune(mut self, advance_prune: Duration) -> Self {
        self.advance_prune = advance_prune;
        self
    }

    pub fn with_discharge_timeout(mut self, discharge_timeout: Duration) -> Self {
        self.discharge_timeout = discharge_timeout;
        self
    }

    /// Use `authority` instead of a [ThirdPartyClient]. The user URL callback
    /// and poll policy only configure the default client.
    pub fn with_authority<A: DischargeAuthority + 'static>(mut self, authority: A) -> Self {
        self.authority = Some(Arc::new(authority));
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_policy(mut self, poll_policy: BackoffPolicy) -> Self {
        self.poll_policy = Some(poll_policy);
        self
    }

    fn authority(&self, user_tokens: &str) -> Result<Arc<dyn DischargeAuthority>, DischargeError> {
        if let Some(authority) = &self.authority {
            return Ok(authority.clone());
        }

        let mut client = ThirdPartyClient::new()?
            .with_debugger(self.debugger.clone())
            .with_clock(self.clock.clone());

        if let Some(callback) = &self.user_url_callback {
            client = client.with_user_url_callback(callback.clone());
        }
        if let Some(poll_policy) = &self.poll_policy {
            client = client.with_poll_policy(poll_policy.clone());
        }
        if !user_tokens.is_empty() {
            client = client
                .with_bearer_authentication(AUTH_HOST, user_tokens)
                .with_bearer_authentication(LOCATION_AUTHENTICATION, user_tokens);
        }

        Ok(Arc::new(client))
    }
}

impl Tokens {
    /// Prune macaroons that can no longer be used, then fetch any discharges
    /// that third party caveats call for. Returns true if the store changed.
    ///
    /// The store is never locked while talking to a third party. Concurrent
    /// calls are not coalesced: each may run its own discharge exchange, and
    /// the last one to finish wins.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        options: UpdateOptions,
    ) -> Result<bool, UpdateError> {
        let pruned = self.prune(options.clock.unix_time(), options.advance_prune);

        match self.discharge_third_party_caveats(cancel, &options).await {
            Ok(discharged) => Ok(pruned || discharged),
            Err(mut error) => {
                error.changed |= pruned;
                Err(error)
            }
        }
    }

    async fn discharge_third_party_caveats(
        &self,
        cancel: &CancellationToken,
        options: &UpdateOptions,
    ) -> Result<bool, UpdateError> {
        let (macaroons, user_tokens) = {
            let buckets = self.buckets.read();
            (buckets.macaroons.join(","), buckets.user_tokens.join(","))
        };

        if macaroons.is_empty() {
            return Ok(false);
        }

        let authority = options
            .authority(&user_tokens)
            .map_err(UpdateError::unchanged)?;

        if !authority
            .needs_discharge(&macaroons)
            .await
            .map_err(UpdateError::unchanged)?
        {
            return Ok(false);
        }

        options
            .debugger
            .debug("Attempting to upgrade authentication token");

        let timeout = options.discharge_timeout;
        let deadline = cancel.child_token();
        let fetch = authority.fetch_discharge_tokens(&deadline, &macaroons);
        tokio::pin!(fetch);

        let result = tokio::select! {
            result = &mut fetch => result,
            _ = tokio::time::sleep(timeout) => {
                deadline.cancel();
                settle(fetch.as_mut(), DischargeError::Timeout(timeout)).await
            }
            _ = cancel.cancelled() => settle(fetch.as_mut(), DischargeError::Cancelled).await,
        };

        match result {
            Ok(discharged) => Ok(self.persist_discharges(&macaroons, &discharged)),
            Err(DischargeFailure { partial, error }) => {
                let changed = partial
                    .map(|partial| self.persist_discharges(&macaroons, &partial))
                    .unwrap_or(false);
                if changed {
                    warn!("Keeping partially discharged macaroons: {}", error);
                }
                Err(UpdateError {
                    changed,
                    source: error,
                })
            }
        }
    }

    fn persist_discharges(&self, before: &str, after: &str) -> bool {
        if after.is_empty() || after == before {
            return false;
        }
        self.replace_macaroon_tokens(Tokens::parse(after).macaroon_tokens());
        true
    }
}

/// Give an interrupted exchange a moment to report its partial result, and
/// attribute the failure to `reason`
async fn settle<F>(fetch: F, reason: DischargeError) -> Result<String, DischargeFailure>
where
    F: Future<Output = Result<String, DischargeFailure>>,
{
    match tokio::time::timeout(SETTLE_TIMEOUT, fetch).await {
        Ok(Ok(discharged)) => Ok(discharged),
        Ok(Err(DischargeFailure { partial, error })) => Err(DischargeFailure {
            partial,
            error: match error {
                DischargeError::Cancelled => reason,
                error => error,
            },
        }),
        Err(_) => Err(reason.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        helpers::{discharge_for, permission_token, RecordingDebugger, ScriptedAuthority},
        macaroon::LOCATION_NEW_AUTHENTICATION,
    };
    use anyhow::Result;
    use fly_common::{helpers::ManualClock, Clock};

    fn options(clock: &ManualClock) -> UpdateOptions {
        UpdateOptions::default().with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn it_does_nothing_without_macaroons() -> Result<()> {
        let clock = ManualClock::default();
        let authority = ScriptedAuthority::needing_discharge();
        let tokens = Tokens::parse("oauth");

        let changed = tokens
            .update(&CancellationToken::new(), options(&clock).with_authority(authority.clone()))
            .await?;

        assert!(!changed);
        assert_eq!(authority.fetches(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn it_reports_pruning_as_a_change() -> Result<()> {
        let clock = ManualClock::default();
        let live = permission_token(clock.unix_time() + 3_600, &[])?;
        let tokens = Tokens::parse(&format!("fm2_junk,{live}"));

        let changed = tokens
            .update(
                &CancellationToken::new(),
                options(&clock).with_authority(ScriptedAuthority::satisfied()),
            )
            .await?;

        assert!(changed);
        assert_eq!(tokens.macaroon_tokens(), vec![live]);
        Ok(())
    }

    #[tokio::test]
    async fn it_replaces_macaroons_with_the_discharged_set() -> Result<()> {
        let clock = ManualClock::default();
        let now = clock.unix_time();
        let permission = permission_token(now + 3_600, &[(LOCATION_NEW_AUTHENTICATION, "t1")])?;
        let discharge = discharge_for(LOCATION_NEW_AUTHENTICATION, "t1", now + 3_600)?;
        let debugger = RecordingDebugger::default();

        let tokens = Tokens::parse(&format!("{permission},oauth"));
        let authority = ScriptedAuthority::needing_discharge()
            .succeeding_with(&format!("{permission},{discharge}"));

        let changed = tokens
            .update(
                &CancellationToken::new(),
                options(&clock)
                    .with_authority(authority.clone())
                    .with_debugger(debugger.clone()),
            )
            .await?;

        assert!(changed);
        assert_eq!(tokens.macaroon_tokens(), vec![permission, discharge]);
        assert_eq!(tokens.user_tokens(), vec!["oauth"]);
        assert_eq!(authority.fetches(), 1);
        assert_eq!(
            debugger.messages(),
            vec!["Attempting to upgrade authentication token"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn it_keeps_a_partial_discharge_when_the_exchange_fails() -> Result<()> {
        let clock = ManualClock::default();
        let now = clock.unix_time();
        let permission = permission_token(
            now + 3_600,
            &[
                (LOCATION_NEW_AUTHENTICATION, "t1"),
                ("https://example.com/3p", "t2"),
            ],
        )?;
        let discharge = discharge_for(LOCATION_NEW_AUTHENTICATION, "t1", now + 3_600)?;
        let partial = format!("{permission},{discharge}");

        let tokens = Tokens::parse(&permission);
        let authority = ScriptedAuthority::needing_discharge().failing_with(
            Some(&partial),
            DischargeError::Refused {
                location: "https://example.com/3p".into(),
                message: "nope".into(),
            },
        );

        let error = tokens
            .update(&CancellationToken::new(), options(&clock).with_authority(authority))
            .await
            .unwrap_err();

        assert!(error.changed);
        assert!(matches!(error.source, DischargeError::Refused { .. }));
        assert_eq!(tokens.macaroon_tokens(), vec![permission, discharge]);
        Ok(())
    }

    #[tokio::test]
    async fn it_leaves_the_store_alone_on_total_failure() -> Result<()> {
        let clock = ManualClock::default();
        let permission =
            permission_token(clock.unix_time() + 3_600, &[(LOCATION_NEW_AUTHENTICATION, "t1")])?;
        let tokens = Tokens::parse(&permission);
        let before = tokens.copy();

        let authority = ScriptedAuthority::needing_discharge()
            .failing_with(Some(&permission), DischargeError::Pending {
                location: LOCATION_NEW_AUTHENTICATION.into(),
            });

        let error = tokens
            .update(&CancellationToken::new(), options(&clock).with_authority(authority))
            .await
            .unwrap_err();

        assert!(!error.changed);
        assert_eq!(tokens, before);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn it_times_out_a_slow_exchange() -> Result<()> {
        let clock = ManualClock::default();
        let permission =
            permission_token(clock.unix_time() + 3_600, &[(LOCATION_NEW_AUTHENTICATION, "t1")])?;
        let tokens = Tokens::parse(&permission);
        let authority = ScriptedAuthority::needing_discharge().hanging();

        let error = tokens
            .update(
                &CancellationToken::new(),
                options(&clock)
                    .with_authority(authority)
                    .with_discharge_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();

        assert!(matches!(error.source, DischargeError::Timeout(timeout) if timeout == Duration::from_secs(5)));
        assert!(!error.changed);
        Ok(())
    }

    #[tokio::test]
    async fn it_gives_up_promptly_when_cancelled() -> Result<()> {
        let clock = ManualClock::default();
        let permission =
            permission_token(clock.unix_time() + 3_600, &[(LOCATION_NEW_AUTHENTICATION, "t1")])?;
        let tokens = Tokens::parse(&permission);
        let authority = ScriptedAuthority::needing_discharge().hanging();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                fly_common::helpers::wait_millis(20).await;
                cancel.cancel();
            })
        };

        let started = std::time::Instant::now();
        let error = tokens
            .update(&cancel, options(&clock).with_authority(authority))
            .await
            .unwrap_err();
        canceller.await?;

        assert!(matches!(error.source, DischargeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn it_stays_usable_while_a_discharge_is_in_flight() -> Result<()> {
        let clock = ManualClock::default();
        let permission =
            permission_token(clock.unix_time() + 3_600, &[(LOCATION_NEW_AUTHENTICATION, "t1")])?;
        let tokens = Arc::new(Tokens::parse(&permission));
        let authority = ScriptedAuthority::needing_discharge().hanging();
        let cancel = CancellationToken::new();

        let update = tokio::spawn({
            let (tokens, cancel) = (tokens.clone(), cancel.clone());
            let options = options(&clock).with_authority(authority.clone());
            async move { tokens.update(&cancel, options).await }
        });

        while authority.fetches() == 0 {
            fly_common::helpers::wait_millis(5).await;
        }

        let header = tokio::time::timeout(
            Duration::from_secs(1),
            tokio::task::spawn_blocking({
                let tokens = tokens.clone();
                move || {
                    tokens.add_tokens(["oauth-late"]);
                    tokens.flaps_header()
                }
            }),
        )
        .await??;

        assert_eq!(header, format!("FlyV1 {permission}"));

        cancel.cancel();
        let error = update.await?.unwrap_err();

        assert!(matches!(error.source, DischargeError::Cancelled));
        assert!(!error.changed);
        assert_eq!(tokens.macaroon_tokens(), vec![permission]);
        assert_eq!(tokens.user_tokens(), vec!["oauth-late"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_settles_on_one_written_set_under_concurrent_writers() -> Result<()> {
        let clock = ManualClock::default();
        let now = clock.unix_time();
        let sets = (0..8u64)
            .map(|index| {
                Ok(vec![
                    permission_token(now + 3_600 + index, &[])?,
                    permission_token(now + 7_200 + index, &[])?,
                ])
            })
            .collect::<Result<Vec<_>>>()?;
        let tokens = Arc::new(Tokens::parse(&permission_token(now + 60, &[])?));

        let mut writers = Vec::new();
        for (index, set) in sets.iter().cloned().enumerate() {
            let tokens = tokens.clone();
            if index % 2 == 0 {
                let options = options(&clock).with_authority(
                    ScriptedAuthority::needing_discharge().succeeding_with(&set.join(",")),
                );
                writers.push(tokio::spawn(async move {
                    tokens.update(&CancellationToken::new(), options).await?;
                    Ok::<_, anyhow::Error>(())
                }));
            } else {
                writers.push(tokio::spawn(async move {
                    tokens.replace_macaroon_tokens(set);
                    Ok(())
                }));
            }
        }

        for writer in writers {
            writer.await??;
        }

        assert!(sets.contains(&tokens.macaroon_tokens()));
        Ok(())
    }
}
