use crate::Action;

/// What a single call is doing and on whose behalf. Built once per call and
/// passed down the request pipeline, where it feeds the tracing span and the
/// `Authorization` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallMetadata {
    pub action: Action,
    pub machine_id: Option<String>,
    /// Sent as the `Authorization` header instead of the client's tokens
    pub authorization: Option<String>,
}

impl CallMetadata {
    pub fn new(action: Action) -> Self {
        CallMetadata {
            action,
            ..Default::default()
        }
    }

    pub fn with_machine_id(mut self, machine_id: &str) -> Self {
        self.machine_id = Some(machine_id.to_owned());
        self
    }

    pub fn with_authorization(mut self, authorization: &str) -> Self {
        self.authorization = Some(authorization.to_owned());
        self
    }
}

impl From<Action> for CallMetadata {
    fn from(action: Action) -> Self {
        CallMetadata::new(action)
    }
}
