use std::fmt::{Debug, Formatter, Result};

use parking_lot::RwLock;
use sha3::{Digest, Sha3_256};

use crate::node::contact::Contact;

/// Number of digest bytes kept in a token.
const TOKEN_LENGTH: usize = 16;

/// An opaque credential a contact hands out in lookup responses and expects back on `STORE`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityToken(pub Vec<u8>);

impl Debug for SecurityToken {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "SecurityToken({})", hex_vec.join(""))
    }
}

/// Issues and validates tokens per requesting contact.
pub trait SecurityTokenProvider: Send + Sync {
    fn issue(&self, requester: &Contact) -> SecurityToken;

    fn validate(&self, requester: &Contact, token: &SecurityToken) -> bool;

    /// Invalidates tokens issued two rotations ago.
    fn rotate(&self) {}
}

struct Secrets {
    current: [u8; 16],
    previous: [u8; 16],
}

/// Tokens derived from a rotating secret and the requester's id and address. A token stays valid
/// until the secret it was derived from has been rotated out twice.
pub struct TokenSecrets {
    secrets: RwLock<Secrets>,
}

impl Default for TokenSecrets {
    fn default() -> Self {
        TokenSecrets::new()
    }
}

impl TokenSecrets {
    pub fn new() -> Self {
        let secret = rand::random::<[u8; 16]>();
        TokenSecrets {
            secrets: RwLock::new(Secrets {
                current: secret,
                previous: secret,
            }),
        }
    }

    fn token_with_secret(secret: &[u8; 16], requester: &Contact) -> SecurityToken {
        let mut hasher = Sha3_256::new();
        hasher.update(secret);
        hasher.update(&requester.id.0);
        hasher.update(requester.addr.to_string().as_bytes());
        SecurityToken(hasher.finalize()[..TOKEN_LENGTH].to_vec())
    }
}

impl SecurityTokenProvider for TokenSecrets {
    fn issue(&self, requester: &Contact) -> SecurityToken {
        Self::token_with_secret(&self.secrets.read().current, requester)
    }

    fn validate(&self, requester: &Contact, token: &SecurityToken) -> bool {
        let secrets = self.secrets.read();
        *token == Self::token_with_secret(&secrets.current, requester)
            || *token == Self::token_with_secret(&secrets.previous, requester)
    }

    fn rotate(&self) {
        let mut secrets = self.secrets.write();
        secrets.previous = secrets.current;
        secrets.current = rand::random::<[u8; 16]>();
        debug!("Security token secret rotated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use std::net::SocketAddr;

    fn contact(port: u16) -> Contact {
        Contact::new(Key::rand(), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_issued_token_validates() {
        let secrets = TokenSecrets::new();
        let requester = contact(1000);
        let token = secrets.issue(&requester);
        assert_eq!(token.0.len(), TOKEN_LENGTH);
        assert!(secrets.validate(&requester, &token));
    }

    #[test]
    fn test_token_is_bound_to_requester() {
        let secrets = TokenSecrets::new();
        let requester = contact(1000);
        let token = secrets.issue(&requester);
        assert!(!secrets.validate(&contact(1001), &token));

        let mut moved = requester.clone();
        moved.addr = SocketAddr::from(([127, 0, 0, 1], 1002));
        assert!(!secrets.validate(&moved, &token));
    }

    #[test]
    fn test_token_expires_after_two_rotations() {
        let secrets = TokenSecrets::new();
        let requester = contact(1000);
        let token = secrets.issue(&requester);

        secrets.rotate();
        assert!(secrets.validate(&requester, &token));

        secrets.rotate();
        assert!(!secrets.validate(&requester, &token));
    }
}
