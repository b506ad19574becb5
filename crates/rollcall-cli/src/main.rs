use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn recognize(&self, credential: &str, group: &str, image: &[u8]) -> zbus::Result<String>;
    async fn enroll(&self, group: &str, identity: &str, image: &[u8]) -> zbus::Result<String>;
    async fn remove_identity(&self, group: &str, identity: &str) -> zbus::Result<u32>;
    async fn list_identities(&self, group: &str) -> zbus::Result<String>;
    async fn issue_key(&self, group: &str, device: &str) -> zbus::Result<String>;
    async fn revoke_key(&self, key: &str) -> zbus::Result<bool>;
    async fn list_keys(&self, group: &str) -> zbus::Result<String>;
    #[zbus(name = "Attendance")]
    async fn attendance_for(&self, group: &str, date: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize a face and record attendance
    Recognize {
        /// Device key issued for the group
        #[arg(short, long)]
        key: String,
        #[arg(short, long)]
        group: String,
        /// Image file (JPEG or PNG)
        image: PathBuf,
    },
    /// Enroll one or more photos of a person
    Enroll {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        identity: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Remove every enrolled photo of a person
    Remove {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        identity: String,
    },
    /// List enrolled identities of a group
    Identities {
        #[arg(short, long)]
        group: String,
    },
    /// Manage device keys
    Keys {
        #[command(subcommand)]
        action: KeyCommand,
    },
    /// Show attendance for a day
    Attendance {
        #[arg(short, long)]
        group: String,
        /// Date as YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Issue a new key; it is shown only once
    Issue {
        #[arg(short, long)]
        group: String,
        #[arg(short, long, default_value = "")]
        device: String,
    },
    /// Revoke a key
    Revoke { key: String },
    /// List keys of a group
    List {
        #[arg(short, long)]
        group: String,
    },
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_else(|_| raw.to_string())),
        Err(_) => println!("{raw}"),
    }
}

fn print_attendance(raw: &str) -> Result<()> {
    let records: Vec<serde_json::Value> =
        serde_json::from_str(raw).context("unexpected attendance payload")?;
    if records.is_empty() {
        println!("No attendance recorded");
        return Ok(());
    }
    for r in &records {
        println!(
            "{:<24} {:<10} {}",
            r["identity"].as_str().unwrap_or("?"),
            r["first_seen"].as_str().unwrap_or("?"),
            r["status"].as_str().unwrap_or("?"),
        );
    }
    println!("{} present", records.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Recognize { key, group, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            print_json(&proxy.recognize(&key, &group, &bytes).await?);
        }
        Commands::Enroll {
            group,
            identity,
            images,
        } => {
            let mut failures = 0;
            for path in &images {
                let result = match std::fs::read(path) {
                    Ok(bytes) => proxy
                        .enroll(&group, &identity, &bytes)
                        .await
                        .map_err(anyhow::Error::from),
                    Err(e) => Err(e.into()),
                };
                match result {
                    Ok(_) => println!("{}: enrolled", path.display()),
                    Err(e) => {
                        failures += 1;
                        eprintln!("{}: {e}", path.display());
                    }
                }
            }
            if failures == images.len() {
                bail!("no photo of {identity} could be enrolled");
            }
        }
        Commands::Remove { group, identity } => {
            let removed = proxy.remove_identity(&group, &identity).await?;
            println!("Removed {removed} signature(s) of {identity}");
        }
        Commands::Identities { group } => {
            print_json(&proxy.list_identities(&group).await?);
        }
        Commands::Keys { action } => match action {
            KeyCommand::Issue { group, device } => {
                let key = proxy.issue_key(&group, &device).await?;
                println!("{key}");
                tracing::info!(group = %group, device = %device, "key issued");
            }
            KeyCommand::Revoke { key } => {
                if proxy.revoke_key(&key).await? {
                    println!("Key revoked");
                } else {
                    bail!("unknown or already revoked key");
                }
            }
            KeyCommand::List { group } => {
                print_json(&proxy.list_keys(&group).await?);
            }
        },
        Commands::Attendance { group, date } => {
            let raw = proxy
                .attendance_for(&group, date.as_deref().unwrap_or(""))
                .await?;
            print_attendance(&raw)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_enroll_requires_images() {
        assert!(Cli::try_parse_from(["rollcall", "enroll", "-g", "12A1", "-i", "alice"]).is_err());
        let cli =
            Cli::try_parse_from(["rollcall", "enroll", "-g", "12A1", "-i", "alice", "a.jpg", "b.jpg"])
                .unwrap();
        match cli.command {
            Commands::Enroll { images, .. } => assert_eq!(images.len(), 2),
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_keys_subcommands() {
        let cli = Cli::try_parse_from(["rollcall", "--session", "keys", "issue", "-g", "12A1"]).unwrap();
        assert!(cli.session);
        match cli.command {
            Commands::Keys {
                action: KeyCommand::Issue { group, device },
            } => {
                assert_eq!(group, "12A1");
                assert_eq!(device, "");
            }
            _ => panic!("expected keys issue"),
        }
    }
}
