use crate::models::{ClientId, UserRef};

/// Identity of one running client: who is signed in and which tab is
/// writing. The client id is generated once and stamped on every mutation.
#[derive(Debug, Clone)]
pub struct ClientSession {
    client_id: ClientId,
    user: UserRef,
}

impl ClientSession {
    pub fn new(user: UserRef) -> Self {
        Self {
            client_id: ClientId::generate(),
            user,
        }
    }

    pub fn with_client_id(user: UserRef, client_id: ClientId) -> Self {
        Self { client_id, user }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn user(&self) -> &UserRef {
        &self.user
    }

    /// Key used to separate cache files between accounts on one device.
    pub fn cache_key(&self) -> &str {
        &self.user.id
    }
}

#[cfg(test)]
mod tests {
    use super::ClientSession;
    use crate::models::UserRef;

    fn user() -> UserRef {
        UserRef {
            id: "u-1".to_string(),
            display_name: "Ada".to_string(),
            username: "ada".to_string(),
            image: None,
        }
    }

    #[test]
    fn each_session_gets_its_own_client_id() {
        let first = ClientSession::new(user());
        let second = ClientSession::new(user());
        assert_ne!(first.client_id(), second.client_id());
        assert_eq!(first.cache_key(), "u-1");
    }
}
