//! Tickets, their sealed form and ticket-file lines.
//!
//! A sealed ticket is `[key type: u32 LE][envelope]` where the envelope holds
//! the bincode encoding of [`Ticket`] encrypted under the server key of that
//! type. All times are seconds since the epoch.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{Result, SecurityError};
use crate::keys::{Key, ServerKeyType};

/// Largest accepted expiry time.
pub const MAX_EXPIRY_TIME: u64 = (i64::MAX / 10000) as u64;

const KEY_TYPE_PREFIX: usize = 4;

/// Principal identity carried by a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// User id. Also the authentication-entity id checked against the blacklist.
    pub uid: u32,
    /// Group ids, primary group first.
    pub gids: Vec<u32>,
    /// Principal name.
    pub user_name: String,
}

/// Decrypted ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Principal.
    pub creds: Credentials,
    /// Session key shared with the ticket holder.
    pub user_key: Key,
    /// Expiry time.
    pub expiry_time: u64,
    /// Issue time of the first ticket in a renewal chain.
    pub creation_time: u64,
    /// Seconds after `creation_time` during which renewal is allowed.
    pub max_renewal_duration: u64,
    /// Issued for a principal outside the cluster.
    pub is_external: bool,
}

impl Ticket {
    /// True once `now` reaches the expiry time.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry_time
    }

    /// End of the renewal window.
    pub fn renewal_deadline(&self) -> u64 {
        self.creation_time
            .saturating_add(self.max_renewal_duration)
            .min(MAX_EXPIRY_TIME)
    }

    /// True while `now` is inside the renewal window.
    pub fn is_renewable(&self, now: u64) -> bool {
        now < self.renewal_deadline()
    }

    /// Encrypts the ticket under `server_key` and prefixes the key type.
    pub fn seal(&self, key_type: ServerKeyType, server_key: &Key) -> Result<Vec<u8>> {
        let plain = bincode::serialize(self)?;
        let mut out = vec![0u8; KEY_TYPE_PREFIX + crypto::encrypted_size(plain.len())];
        out[..KEY_TYPE_PREFIX].copy_from_slice(&key_type.as_u32().to_le_bytes());
        crypto::encrypt(server_key, &plain, &mut out[KEY_TYPE_PREFIX..])?;
        Ok(out)
    }

    /// Decrypts a sealed ticket with the key its prefix names.
    pub fn unseal(sealed: &[u8], server_key: &Key) -> Result<Self> {
        if sealed.len() < KEY_TYPE_PREFIX + crypto::ENCRYPTION_OVERHEAD {
            return Err(SecurityError::InvalidArgument(format!(
                "sealed ticket of {} bytes is truncated",
                sealed.len()
            )));
        }
        let plain = crypto::decrypt_to_vec(server_key, &sealed[KEY_TYPE_PREFIX..])?;
        // Bytes that pass the tag check but do not decode are still corrupt.
        bincode::deserialize(&plain).map_err(|_| SecurityError::AuthDecryptFailure)
    }
}

/// Reads the key type a sealed ticket was issued under.
pub fn peek_key_type(sealed: &[u8]) -> Result<ServerKeyType> {
    let prefix: [u8; KEY_TYPE_PREFIX] = sealed
        .get(..KEY_TYPE_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| SecurityError::InvalidArgument("sealed ticket too short".into()))?;
    ServerKeyType::from_u32(u32::from_le_bytes(prefix))
}

/// Ticket as held by its owner: the sealed form plus the cleartext fields the
/// owner needs without the server key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketAndKey {
    /// Sealed ticket presented to servers.
    pub encrypted_ticket: Vec<u8>,
    /// Session key.
    pub user_key: Key,
    /// Principal.
    pub user_creds: Credentials,
    /// Expiry time.
    pub expiry_time: u64,
    /// Issue time of the renewal chain.
    pub creation_time: u64,
    /// Renewal window length in seconds.
    pub max_renewal_duration: u64,
    /// External principal.
    pub is_external: bool,
}

impl TicketAndKey {
    /// True while the ticket has not expired.
    pub fn is_usable(&self, now: u64) -> bool {
        now < self.expiry_time
    }

    /// Encodes the ticket as one ticket-file line without the newline.
    pub fn to_line(&self, cluster: &str) -> Result<String> {
        if cluster.is_empty() || cluster.contains(char::is_whitespace) {
            return Err(SecurityError::InvalidArgument(format!(
                "bad cluster name '{cluster}'"
            )));
        }
        let bytes = bincode::serialize(self)?;
        Ok(format!("{cluster} {}", STANDARD.encode(bytes)))
    }

    /// Parses a ticket-file line. Returns `None` for blank and `#` lines.
    pub fn parse_line(line: &str) -> Result<Option<(String, TicketAndKey)>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (cluster, encoded) = line.split_once(char::is_whitespace).ok_or_else(|| {
            SecurityError::Serialization(format!(
                "ticket line without payload: '{}'",
                truncate(line)
            ))
        })?;
        let bytes = STANDARD.decode(encoded.trim())?;
        let tk: TicketAndKey = bincode::deserialize(&bytes)?;
        Ok(Some((cluster.to_string(), tk)))
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(32) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Issues a ticket for `creds` sealed under `server_key`.
#[allow(clippy::too_many_arguments)]
pub fn generate(
    key_type: ServerKeyType,
    server_key: &Key,
    creds: Credentials,
    expiry_time: u64,
    creation_time: u64,
    max_renewal_duration: u64,
    is_external: bool,
) -> Result<TicketAndKey> {
    if expiry_time > MAX_EXPIRY_TIME {
        return Err(SecurityError::InvalidArgument(format!(
            "expiry time {expiry_time} exceeds {MAX_EXPIRY_TIME}"
        )));
    }
    let ticket = Ticket {
        creds,
        user_key: crypto::random_key(),
        expiry_time,
        creation_time,
        max_renewal_duration,
        is_external,
    };
    let encrypted_ticket = ticket.seal(key_type, server_key)?;
    Ok(TicketAndKey {
        encrypted_ticket,
        user_key: ticket.user_key.clone(),
        user_creds: ticket.creds.clone(),
        expiry_time,
        creation_time,
        max_renewal_duration,
        is_external,
    })
}

/// Reissues `old` with a new expiry, keeping principal and renewal chain.
pub fn renew(
    key_type: ServerKeyType,
    server_key: &Key,
    old: &Ticket,
    new_expiry_time: u64,
    now: u64,
) -> Result<TicketAndKey> {
    if !old.is_renewable(now) {
        return Err(SecurityError::Expired(format!(
            "renewal window for uid {} closed at {}",
            old.creds.uid,
            old.renewal_deadline()
        )));
    }
    if new_expiry_time > old.renewal_deadline() {
        return Err(SecurityError::InvalidArgument(format!(
            "expiry {new_expiry_time} beyond renewal deadline {}",
            old.renewal_deadline()
        )));
    }
    generate(
        key_type,
        server_key,
        old.creds.clone(),
        new_expiry_time,
        old.creation_time,
        old.max_renewal_duration,
        old.is_external,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            uid: 1000,
            gids: vec![1000, 27],
            user_name: "mapr".into(),
        }
    }

    #[test]
    fn test_generate_then_unseal() {
        let server = Key([3; 32]);
        let tk = generate(ServerKeyType::CldbKey, &server, creds(), 5000, 1000, 10_000, false).unwrap();
        assert_eq!(peek_key_type(&tk.encrypted_ticket).unwrap(), ServerKeyType::CldbKey);
        let t = Ticket::unseal(&tk.encrypted_ticket, &server).unwrap();
        assert_eq!(t.creds, creds());
        assert_eq!(t.expiry_time, 5000);
        assert_eq!(t.user_key, tk.user_key);
    }

    #[test]
    fn test_expiry_bound() {
        let server = Key([3; 32]);
        assert!(generate(ServerKeyType::ServerKey, &server, creds(), MAX_EXPIRY_TIME, 0, 0, false).is_ok());
        assert!(matches!(
            generate(ServerKeyType::ServerKey, &server, creds(), MAX_EXPIRY_TIME + 1, 0, 0, false),
            Err(SecurityError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_windows() {
        let server = Key([3; 32]);
        let tk = generate(ServerKeyType::CldbKey, &server, creds(), 200, 100, 500, false).unwrap();
        let t = Ticket::unseal(&tk.encrypted_ticket, &server).unwrap();
        assert!(tk.is_usable(150));
        assert!(!tk.is_usable(200));
        assert!(t.is_renewable(599));
        assert!(!t.is_renewable(600));

        let renewed = renew(ServerKeyType::CldbKey, &server, &t, 600, 300).unwrap();
        assert_eq!(renewed.creation_time, 100);
        assert_eq!(renewed.user_creds, creds());
        assert!(matches!(
            renew(ServerKeyType::CldbKey, &server, &t, 601, 300),
            Err(SecurityError::InvalidArgument(_))
        ));
        assert!(matches!(
            renew(ServerKeyType::CldbKey, &server, &t, 550, 600),
            Err(SecurityError::Expired(_))
        ));
    }

    #[test]
    fn test_peek_rejects_garbage() {
        assert!(matches!(peek_key_type(&[1, 2]), Err(SecurityError::InvalidArgument(_))));
        assert!(matches!(
            peek_key_type(&[9, 0, 0, 0, 1]),
            Err(SecurityError::UnknownKeyType(9))
        ));
    }

    #[test]
    fn test_file_line() {
        let server = Key([3; 32]);
        let tk = generate(ServerKeyType::CldbKey, &server, creds(), 200, 100, 500, false).unwrap();
        let line = tk.to_line("prod.example.com").unwrap();
        let (cluster, parsed) = TicketAndKey::parse_line(&line).unwrap().unwrap();
        assert_eq!(cluster, "prod.example.com");
        assert_eq!(parsed, tk);
        assert!(TicketAndKey::parse_line("  # comment").unwrap().is_none());
        assert!(TicketAndKey::parse_line("lonely").is_err());
        assert!(tk.to_line("two words").is_err());
    }
}
