use parking_lot::RwLock;
use std::{fmt::Debug, str::FromStr};

use crate::macaroon::{is_macaroon, Macaroon};

/// The services that accept fly.io credentials. They differ in which kinds of
/// token they will look at: only GraphQL accepts macaroons and user tokens in
/// the same request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    Flaps,
    Docker,
    Nats,
    Bubblegum,
    GraphQl,
}

impl Service {
    fn accepts_both(&self) -> bool {
        matches!(self, Service::GraphQl)
    }
}

/// Strip any number of leading `Bearer` / `FlyV1` authorization schemes
/// (compared case-insensitively) from a credential string
pub fn strip_authorization_scheme(token: &str) -> &str {
    let mut token = token.trim();

    while let Some((scheme, rest)) = token.split_once(char::is_whitespace) {
        if scheme.eq_ignore_ascii_case("Bearer") || scheme.eq_ignore_ascii_case("FlyV1") {
            token = rest.trim();
        } else {
            break;
        }
    }

    if token.eq_ignore_ascii_case("Bearer") || token.eq_ignore_ascii_case("FlyV1") {
        return "";
    }

    token
}

/// Shorthand for [Tokens::parse]
pub fn parse(token: &str) -> Tokens {
    Tokens::parse(token)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct TokenBuckets {
    pub macaroons: Vec<String>,
    pub user_tokens: Vec<String>,
    pub from_file: Option<String>,
}

impl TokenBuckets {
    pub fn add<T: AsRef<str>>(&mut self, token: T) {
        let token = token.as_ref().trim();
        if token.is_empty() {
            return;
        }
        if is_macaroon(token) {
            self.macaroons.push(token.to_owned());
        } else {
            self.user_tokens.push(token.to_owned());
        }
    }
}

/// The set of tokens belonging to a user: macaroons (per organization) and
/// user tokens (per user). Any mix of the two is normal.
///
/// [Tokens] is meant to be shared (usually as an `Arc<Tokens>`) by every
/// request pipeline acting on behalf of the same principal, so all of its
/// methods take `&self`. Reads take a shared lock and writes an exclusive
/// one; no lock is ever held across I/O or while another store is locked.
#[derive(Default)]
pub struct Tokens {
    pub(crate) buckets: RwLock<TokenBuckets>,
}

impl Tokens {
    pub(crate) fn from_buckets(buckets: TokenBuckets) -> Self {
        Tokens {
            buckets: RwLock::new(buckets),
        }
    }

    pub(crate) fn snapshot(&self) -> TokenBuckets {
        self.buckets.read().clone()
    }

    /// Extract individual tokens from a credential string. The input may
    /// carry an authorization scheme (`Bearer` or `FlyV1`) followed by a
    /// comma-separated list of macaroon and user tokens.
    pub fn parse(token: &str) -> Self {
        let mut buckets = TokenBuckets::default();
        for token in strip_authorization_scheme(token).split(',') {
            buckets.add(token);
        }
        Tokens::from_buckets(buckets)
    }

    /// Like [Tokens::parse], also recording the path the credentials were read
    /// from
    pub fn parse_from_file(token: &str, from_file: &str) -> Self {
        let tokens = Tokens::parse(token);
        tokens.buckets.write().from_file = Some(from_file.to_owned());
        tokens
    }

    /// Classify and append each of the given tokens
    pub fn add_tokens<I, T>(&self, tokens: I) -> &Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut buckets = self.buckets.write();
        for token in tokens {
            buckets.add(token);
        }
        self
    }

    /// A deep copy of this store
    pub fn copy(&self) -> Self {
        Tokens::from_buckets(self.snapshot())
    }

    /// A copy of this store that holds only its macaroons
    pub fn macaroons_only(&self) -> Self {
        let buckets = self.buckets.read();
        Tokens::from_buckets(TokenBuckets {
            macaroons: buckets.macaroons.clone(),
            user_tokens: Vec::new(),
            from_file: buckets.from_file.clone(),
        })
    }

    /// A copy of this store that holds only its user tokens
    pub fn user_tokens_only(&self) -> Self {
        let buckets = self.buckets.read();
        Tokens::from_buckets(TokenBuckets {
            macaroons: Vec::new(),
            user_tokens: buckets.user_tokens.clone(),
            from_file: buckets.from_file.clone(),
        })
    }

    pub fn macaroon_tokens(&self) -> Vec<String> {
        self.buckets.read().macaroons.clone()
    }

    pub fn user_tokens(&self) -> Vec<String> {
        self.buckets.read().user_tokens.clone()
    }

    /// The path given to [Tokens::parse_from_file], if any
    pub fn from_file(&self) -> Option<String> {
        self.buckets.read().from_file.clone()
    }

    /// Overwrite the contents of this store with those of `other`. Returns
    /// false (and writes nothing) if the two are already equal.
    pub fn replace(&self, other: &Tokens) -> bool {
        let incoming = other.snapshot();
        let mut buckets = self.buckets.write();
        if *buckets == incoming {
            return false;
        }
        *buckets = incoming;
        true
    }

    /// Overwrite only the macaroon tokens of this store
    pub fn replace_macaroon_tokens<I, T>(&self, macaroons: I)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let macaroons = macaroons
            .into_iter()
            .map(|token| token.as_ref().trim().to_owned())
            .filter(|token| !token.is_empty())
            .collect();
        self.buckets.write().macaroons = macaroons;
    }

    /// Value equality of both token lists and the provenance
    pub fn equal(&self, other: &Tokens) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let theirs = other.snapshot();
        *self.buckets.read() == theirs
    }

    pub fn is_empty(&self) -> bool {
        let buckets = self.buckets.read();
        buckets.macaroons.is_empty() && buckets.user_tokens.is_empty()
    }

    /// The caveat names of the first macaroon, for diagnostics
    pub fn caveat_names(&self) -> Vec<String> {
        let first = self.buckets.read().macaroons.first().cloned();
        first
            .and_then(|token| Macaroon::decode(&token).ok())
            .map(|macaroon| macaroon.caveat_names())
            .unwrap_or_default()
    }

    /// Render the tokens that `service` accepts as a single comma-joined
    /// string, optionally preceded by the matching authorization scheme
    /// (`FlyV1` when macaroons are present, `Bearer` otherwise)
    pub fn normalized(&self, service: Service, include_scheme: bool) -> String {
        let buckets = self.buckets.read();

        let scheme = match (include_scheme, buckets.macaroons.is_empty()) {
            (false, _) => "",
            (true, true) => "Bearer ",
            (true, false) => "FlyV1 ",
        };

        let tokens = if service.accepts_both() {
            [buckets.macaroons.as_slice(), buckets.user_tokens.as_slice()].concat()
        } else if buckets.macaroons.is_empty() {
            buckets.user_tokens.clone()
        } else {
            buckets.macaroons.clone()
        };

        format!("{}{}", scheme, tokens.join(","))
    }

    pub fn flaps(&self) -> String {
        self.normalized(Service::Flaps, false)
    }

    pub fn flaps_header(&self) -> String {
        self.normalized(Service::Flaps, true)
    }

    pub fn docker(&self) -> String {
        self.normalized(Service::Docker, false)
    }

    pub fn nats(&self) -> String {
        self.normalized(Service::Nats, false)
    }

    pub fn bubblegum(&self) -> String {
        self.normalized(Service::Bubblegum, false)
    }

    pub fn bubblegum_header(&self) -> String {
        self.normalized(Service::Bubblegum, true)
    }

    pub fn graphql(&self) -> String {
        self.normalized(Service::GraphQl, false)
    }

    pub fn graphql_header(&self) -> String {
        self.normalized(Service::GraphQl, true)
    }

    /// Every token, macaroons first
    pub fn all(&self) -> String {
        self.normalized(Service::GraphQl, false)
    }

    pub fn all_header(&self) -> String {
        self.normalized(Service::GraphQl, true)
    }
}

impl Clone for Tokens {
    fn clone(&self) -> Self {
        self.copy()
    }
}

impl PartialEq for Tokens {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Eq for Tokens {}

impl FromStr for Tokens {
    type Err = std::convert::Infallible;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Ok(Tokens::parse(token))
    }
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = self.buckets.read();
        f.debug_struct("Tokens")
            .field("macaroons", &buckets.macaroons.len())
            .field("user_tokens", &buckets.user_tokens.len())
            .field("from_file", &buckets.from_file)
            .finish()
    }
}
