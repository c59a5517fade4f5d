use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use trustfs_dispatch::{current_time_seconds, CpuQid, DispatchConfig, DispatchPool, GlobalDispatch};
use trustfs_gtrace::{GTrace, GTraceConfig};
use trustfs_security::{KeyFileRecord, Security, SecurityConfig, ServerKeyType, TicketAndKey};

#[derive(Parser, Debug)]
#[command(name = "trustfs-keytool")]
#[command(about = "TrustFS server key and ticket administration", long_about = None)]
pub struct Cli {
    /// Security config file (.toml or .json).
    #[arg(short, long, env = "TRUSTFS_SECURITY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a server key and append it to a key file.
    Genkey {
        #[arg(short = 't', long, default_value = "cldb")]
        key_type: ServerKeyType,
        /// Key file, defaults to `<key_file_dir>/<type>.key`.
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Key expiry, seconds since the epoch; 0 for none.
        #[arg(long, default_value = "0")]
        expiry: u64,
    },
    /// Mint a ticket and append it to a ticket file.
    GenTicket {
        cluster: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        uid: u32,
        /// Comma separated; defaults to the uid.
        #[arg(long, value_delimiter = ',')]
        gids: Vec<u32>,
        #[arg(long, default_value = "1209600")]
        lifetime_secs: u64,
        #[arg(long, default_value = "2592000")]
        renewal_secs: u64,
        #[arg(short = 't', long, default_value = "cldb")]
        key_type: ServerKeyType,
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Ticket file, defaults to the user ticket file location.
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[arg(long)]
        external: bool,
    },
    /// List the tickets in a ticket file.
    Show {
        #[arg(short, long)]
        ticket_file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Decrypt and validate every ticket in a ticket file.
    Verify {
        #[arg(short, long)]
        ticket_file: Option<PathBuf>,
        #[arg(short = 'k', long, default_value = "cldb")]
        key_type: ServerKeyType,
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
    /// Print the ticket file location of the current user.
    TicketPath,
}

#[derive(Debug, Serialize)]
struct TicketSummary {
    cluster: String,
    user: String,
    uid: u32,
    gids: Vec<u32>,
    expires: String,
    usable: bool,
    external: bool,
}

impl TicketSummary {
    fn new(cluster: String, tk: &TicketAndKey) -> Self {
        Self {
            cluster,
            user: tk.user_creds.user_name.clone(),
            uid: tk.user_creds.uid,
            gids: tk.user_creds.gids.clone(),
            expires: format_time(tk.expiry_time),
            usable: tk.is_usable(current_time_seconds()),
            external: tk.is_external,
        }
    }
}

fn format_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(f, "{line}")?;
    Ok(())
}

fn read_tickets(path: &Path) -> Result<Vec<(String, TicketAndKey)>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut out = Vec::new();
    for line in text.lines() {
        if let Some(entry) = TicketAndKey::parse_line(line)? {
            out.push(entry);
        }
    }
    Ok(out)
}

impl Cli {
    fn load_config(&self) -> Result<SecurityConfig> {
        match &self.config {
            Some(path) => SecurityConfig::from_file(path),
            None => Ok(SecurityConfig::default()),
        }
    }

    /// Runs the command, writing its report to `out`.
    pub async fn run<W: Write>(self, out: &mut W) -> Result<()> {
        let config = self.load_config()?;
        let dispatch = Arc::new(GlobalDispatch::new(DispatchConfig::default()));
        let tracer = Arc::new(GTrace::in_memory(GTraceConfig::default()));
        let security = Arc::new(Security::new(config, dispatch.clone(), tracer));

        match self.command {
            Command::Genkey {
                key_type,
                out: path,
                expiry,
            } => {
                let path = path.unwrap_or_else(|| security.config().key_file_path(key_type));
                let record = KeyFileRecord {
                    key_type: key_type.as_u32(),
                    key: security.generate_random_key(),
                    expiry_time: expiry,
                };
                append_line(&path, &record.to_key_file_line()?)?;
                tracing::info!(%key_type, path = %path.display(), "server key generated");
                writeln!(out, "wrote {key_type} key to {}", path.display())?;
            }
            Command::GenTicket {
                cluster,
                user,
                uid,
                gids,
                lifetime_secs,
                renewal_secs,
                key_type,
                key_file,
                out: path,
                external,
            } => {
                let key_file = key_file.unwrap_or_else(|| security.config().key_file_path(key_type));
                security.set_key_file(key_type, &key_file)?;
                let gids = if gids.is_empty() { vec![uid] } else { gids };
                let expiry = current_time_seconds().saturating_add(lifetime_secs);
                let tk = security.generate_ticket_and_key(
                    key_type,
                    &user,
                    uid,
                    &gids,
                    expiry,
                    renewal_secs,
                    external,
                )?;
                let path = path.unwrap_or_else(|| security.user_ticket_file_location());
                append_line(&path, &tk.to_line(&cluster)?)?;
                writeln!(
                    out,
                    "wrote ticket for {user} (uid {uid}) on {cluster} to {}, expires {}",
                    path.display(),
                    format_time(expiry)
                )?;
            }
            Command::Show { ticket_file, json } => {
                let path = ticket_file.unwrap_or_else(|| security.user_ticket_file_location());
                let summaries: Vec<_> = read_tickets(&path)?
                    .into_iter()
                    .map(|(c, tk)| TicketSummary::new(c, &tk))
                    .collect();
                if json {
                    writeln!(out, "{}", serde_json::to_string_pretty(&summaries)?)?;
                } else {
                    for s in &summaries {
                        writeln!(
                            out,
                            "{} user={} uid={} gids={:?} expires={} usable={}",
                            s.cluster, s.user, s.uid, s.gids, s.expires, s.usable
                        )?;
                    }
                }
            }
            Command::Verify {
                ticket_file,
                key_type,
                key_file,
            } => {
                let key_file = key_file.unwrap_or_else(|| security.config().key_file_path(key_type));
                security.set_key_file(key_type, &key_file)?;
                let path = ticket_file.unwrap_or_else(|| security.user_ticket_file_location());
                let tickets = read_tickets(&path)?;

                let pool = DispatchPool::start(dispatch, &[CpuQid::Rpc])?;
                let mut failed = 0;
                for (cluster, tk) in tickets {
                    match security.decrypt_ticket_await(tk.encrypted_ticket).await {
                        Ok(t) => writeln!(out, "{cluster}: ok uid={}", t.creds.uid)?,
                        Err(e) => {
                            failed += 1;
                            writeln!(out, "{cluster}: {e}")?;
                        }
                    }
                }
                pool.shutdown();
                if failed > 0 {
                    anyhow::bail!("{failed} ticket(s) failed validation");
                }
            }
            Command::TicketPath => {
                writeln!(out, "{}", security.user_ticket_file_location().display())?;
            }
        }
        Ok(())
    }
}
