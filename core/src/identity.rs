use uuid::Uuid;

/// Characters of a generated token appended to the agent id in session ids.
const SESSION_TOKEN_LEN: usize = 12;

/// User and session identifiers attached to one upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub session_id: String,
}

impl Identity {
    /// Use the caller's identifiers, synthesizing whichever one is missing.
    ///
    /// Empty strings count as missing. Nothing is cached: two requests without
    /// identifiers get two unrelated identities.
    pub fn resolve(agent_id: &str, user_id: Option<&str>, session_id: Option<&str>) -> Self {
        let user_id = user_id
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_user_id);
        let session_id = session_id
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| generate_session_id(agent_id));
        Self {
            user_id,
            session_id,
        }
    }
}

/// `user-` followed by a random v4 UUID.
pub fn generate_user_id() -> String {
    format!("user-{}", Uuid::new_v4())
}

/// `{agent_id}-` followed by the first 12 characters of a random v4 UUID.
pub fn generate_session_id(agent_id: &str) -> String {
    let token = Uuid::new_v4().to_string();
    format!("{agent_id}-{}", &token[..SESSION_TOKEN_LEN])
}
