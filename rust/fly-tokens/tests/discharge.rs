use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use fly_common::helpers::ManualClock;
use fly_tokens::{
    discharge::{
        user_url_callback, DischargeAuthority, DischargeRequest, DischargeResponse,
        ThirdPartyClient, DISCHARGE_PATH,
    },
    helpers::RecordingDebugger,
    macaroon::{Macaroon, LOCATION_PERMISSION},
    DischargeError, Tokens, UpdateOptions,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

const NOT_AFTER: u64 = 4_000_000_000;

#[derive(Default)]
struct ThirdParty {
    location: String,
    polls: Mutex<HashMap<String, u32>>,
    authorization: Mutex<Vec<Option<String>>>,
}

impl ThirdParty {
    fn discharge(&self, ticket: &str) -> String {
        Macaroon::new(&self.location, ticket)
            .with_validity(0, NOT_AFTER)
            .encode()
            .unwrap()
    }

    fn record(&self, headers: &HeaderMap) {
        self.authorization.lock().push(
            headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
        );
    }
}

async fn discharge(
    State(third_party): State<Arc<ThirdParty>>,
    headers: HeaderMap,
    Json(request): Json<DischargeRequest>,
) -> (StatusCode, Json<DischargeResponse>) {
    third_party.record(&headers);

    match request.ticket.as_str() {
        "refuse" => (StatusCode::FORBIDDEN, Json(DischargeResponse::error("nope"))),
        "poll" => (
            StatusCode::CREATED,
            Json(DischargeResponse::poll("/poll/poll")),
        ),
        "interactive" => (
            StatusCode::OK,
            Json(DischargeResponse::user_interactive(
                "/login",
                "/poll/interactive",
            )),
        ),
        ticket => (
            StatusCode::OK,
            Json(DischargeResponse::discharge(&third_party.discharge(ticket))),
        ),
    }
}

async fn poll(
    State(third_party): State<Arc<ThirdParty>>,
    Path(ticket): Path<String>,
) -> (StatusCode, Json<DischargeResponse>) {
    let count = {
        let mut polls = third_party.polls.lock();
        let count = polls.entry(ticket.clone()).or_default();
        *count += 1;
        *count
    };

    if count < 3 {
        (StatusCode::ACCEPTED, Json(DischargeResponse::default()))
    } else {
        (
            StatusCode::OK,
            Json(DischargeResponse::discharge(&third_party.discharge(&ticket))),
        )
    }
}

async fn start_third_party() -> Result<Arc<ThirdParty>> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let third_party = Arc::new(ThirdParty {
        location: format!("http://{}", listener.local_addr()?),
        ..Default::default()
    });

    let app = Router::new()
        .route(DISCHARGE_PATH, post(discharge))
        .route("/poll/:ticket", get(poll))
        .with_state(third_party.clone());

    tokio::spawn(async move { axum::serve(listener, app).await });

    Ok(third_party)
}

fn permission_token(third_party: &ThirdParty, tickets: &[&str]) -> Result<String> {
    let mut macaroon = Macaroon::new(LOCATION_PERMISSION, "permission").with_validity(0, NOT_AFTER);
    for ticket in tickets {
        macaroon = macaroon.with_third_party(&third_party.location, ticket);
    }
    Ok(macaroon.encode()?)
}

fn client() -> Result<ThirdPartyClient> {
    Ok(ThirdPartyClient::new()?.with_clock(Arc::new(ManualClock::default())))
}

#[tokio::test]
async fn it_fetches_discharges_directly_and_by_polling() -> Result<()> {
    fly_common::tracing::initialize_tracing();

    let third_party = start_third_party().await?;
    let permission = permission_token(&third_party, &["direct", "poll"])?;
    let client = client()?;

    assert!(client.needs_discharge(&permission).await?);

    let discharged = client
        .fetch_discharge_tokens(&CancellationToken::new(), &permission)
        .await?;

    assert_eq!(
        discharged,
        format!(
            "{},{},{}",
            permission,
            third_party.discharge("direct"),
            third_party.discharge("poll")
        )
    );
    assert_eq!(third_party.polls.lock().get("poll"), Some(&3));
    assert!(!client.needs_discharge(&discharged).await?);
    Ok(())
}

#[tokio::test]
async fn it_sends_the_user_to_a_url_when_asked() -> Result<()> {
    let third_party = start_third_party().await?;
    let permission = permission_token(&third_party, &["interactive"])?;
    let visited = Arc::new(Mutex::new(Vec::new()));

    let client = client()?.with_user_url_callback(user_url_callback({
        let visited = visited.clone();
        move |_cancel, url| {
            let visited = visited.clone();
            async move {
                visited.lock().push(url);
                Ok(())
            }
        }
    }));

    let discharged = client
        .fetch_discharge_tokens(&CancellationToken::new(), &permission)
        .await?;

    assert_eq!(*visited.lock(), vec![format!("{}/login", third_party.location)]);
    assert!(discharged.ends_with(&third_party.discharge("interactive")));
    Ok(())
}

#[tokio::test]
async fn it_fails_when_nobody_can_visit_the_user_url() -> Result<()> {
    let third_party = start_third_party().await?;
    let permission = permission_token(&third_party, &["interactive"])?;

    let failure = client()?
        .fetch_discharge_tokens(&CancellationToken::new(), &permission)
        .await
        .unwrap_err();

    assert!(failure.partial.is_none());
    match failure.error {
        DischargeError::UserInteractionRequired { url, .. } => {
            assert_eq!(url, format!("{}/login", third_party.location))
        }
        other => panic!("Unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn it_returns_partial_progress_alongside_a_refusal() -> Result<()> {
    let third_party = start_third_party().await?;
    let permission = permission_token(&third_party, &["direct", "refuse"])?;

    let failure = client()?
        .fetch_discharge_tokens(&CancellationToken::new(), &permission)
        .await
        .unwrap_err();

    assert_eq!(
        failure.partial,
        Some(format!("{},{}", permission, third_party.discharge("direct")))
    );
    match failure.error {
        DischargeError::Refused { message, .. } => assert_eq!(message, "nope"),
        other => panic!("Unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn it_presents_user_tokens_only_to_configured_third_parties() -> Result<()> {
    let third_party = start_third_party().await?;
    let permission = permission_token(&third_party, &["direct"])?;

    client()?
        .fetch_discharge_tokens(&CancellationToken::new(), &permission)
        .await?;
    client()?
        .with_bearer_authentication(&third_party.location, "oauth1,oauth2")
        .fetch_discharge_tokens(&CancellationToken::new(), &permission)
        .await?;

    assert_eq!(
        *third_party.authorization.lock(),
        vec![None, Some("Bearer oauth1,oauth2".to_owned())]
    );
    Ok(())
}

#[tokio::test]
async fn it_keeps_partial_discharges_in_the_store() -> Result<()> {
    let third_party = start_third_party().await?;
    let permission = permission_token(&third_party, &["direct", "refuse"])?;
    let tokens = Tokens::parse(&format!("FlyV1 {permission},oauth"));
    let debugger = RecordingDebugger::default();

    let error = tokens
        .update(
            &CancellationToken::new(),
            UpdateOptions::default()
                .with_debugger(debugger.clone())
                .with_authority(client()?.with_debugger(Arc::new(debugger.clone()))),
        )
        .await
        .unwrap_err();

    assert!(error.changed);
    assert_eq!(
        tokens.macaroon_tokens(),
        vec![permission, third_party.discharge("direct")]
    );
    assert_eq!(tokens.user_tokens(), vec!["oauth"]);

    let messages = debugger.messages();
    assert_eq!(messages[0], "Attempting to upgrade authentication token");
    assert!(messages
        .iter()
        .any(|message| message.starts_with("Request: ") && message.ends_with(DISCHARGE_PATH)));
    Ok(())
}

#[tokio::test]
async fn it_keeps_discharges_obtained_before_the_user_gives_up() -> Result<()> {
    let third_party = start_third_party().await?;
    let permission = permission_token(&third_party, &["direct", "interactive"])?;
    let tokens = Tokens::parse(&permission);
    let handed_out = Arc::new(Mutex::new(None::<CancellationToken>));

    let error = tokens
        .update(
            &CancellationToken::new(),
            UpdateOptions::default()
                .with_discharge_timeout(Duration::from_millis(500))
                .with_user_url_callback({
                    let handed_out = handed_out.clone();
                    move |cancel: CancellationToken, _url: String| {
                        *handed_out.lock() = Some(cancel);
                        futures::future::pending::<anyhow::Result<()>>()
                    }
                }),
        )
        .await
        .unwrap_err();

    assert!(matches!(error.source, DischargeError::Timeout(_)));
    assert!(error.changed);
    assert_eq!(
        tokens.macaroon_tokens(),
        vec![permission, third_party.discharge("direct")]
    );
    assert!(handed_out
        .lock()
        .as_ref()
        .is_some_and(CancellationToken::is_cancelled));
    Ok(())
}
