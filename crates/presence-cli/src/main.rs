use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use presence_core::{AttendanceDayRecord, AttendanceOutcome, DayStatus};
use serde_json::Value;
use std::path::PathBuf;

// `#[zbus::proxy]` generates `AttendanceProxy`, with `receive_*` signal streams.
#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    async fn register(
        &self,
        name: &str,
        image_paths: Vec<String>,
        email: &str,
        phone: &str,
        department: &str,
    ) -> zbus::Result<String>;
    async fn remove(&self, name: &str) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn checkout(&self, name: &str) -> zbus::Result<String>;
    async fn status(&self, name: &str) -> zbus::Result<String>;
    async fn today(&self) -> zbus::Result<String>;
    async fn checked_in(&self) -> zbus::Result<String>;
    async fn records(&self, from: &str, to: &str, name: &str) -> zbus::Result<String>;
    async fn summary(&self, from: &str, to: &str) -> zbus::Result<String>;
    async fn start(&self) -> zbus::Result<bool>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn daemon_status(&self) -> zbus::Result<String>;
    async fn purge(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn attendance_changed(&self, name: &str, status: &str, timestamp: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn face_seen(
        &self,
        name: &str,
        confidence: f64,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Print raw JSON replies
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register (or re-register) a person from one or more face images
    Register {
        name: String,
        /// Images containing exactly one face each
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        department: String,
    },
    /// Remove a registered person (attendance history is kept)
    Remove { name: String },
    /// List registered people
    List,
    /// Check a person out manually
    Checkout { name: String },
    /// Show today's attendance state for a person
    Status { name: String },
    /// Show today's attendance records
    Today {
        /// Only people currently checked in
        #[arg(long)]
        present: bool,
    },
    /// Show attendance records
    Report {
        /// First date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Last date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Days present per person
    Summary {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Start the camera recognition loop
    Start,
    /// Stop the camera recognition loop
    Stop,
    /// Show daemon status
    Daemon,
    /// Stream attendance changes until interrupted
    Watch {
        /// Also print every face the camera sees
        #[arg(long)]
        faces: bool,
    },
    /// Delete all attendance records, people and templates
    Purge {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(system_bus = cli.system, "connecting to presenced");

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    let connection = connection.context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("presenced is not reachable")?;

    match cli.command {
        Commands::Register {
            name,
            images,
            email,
            phone,
            department,
        } => {
            // The daemon resolves paths against its own working directory.
            let paths = images
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p)
                        .with_context(|| format!("cannot access {}", p.display()))
                        .map(|p| p.to_string_lossy().into_owned())
                })
                .collect::<Result<Vec<_>>>()?;
            let reply = proxy.register(&name, paths, &email, &phone, &department).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let v: Value = serde_json::from_str(&reply)?;
                let verb = if v["replaced"].as_bool().unwrap_or(false) { "Updated" } else { "Registered" };
                println!("{verb} {name} from {} image(s)", v["images_used"]);
                if v["images_skipped"].as_u64().unwrap_or(0) > 0 {
                    println!("Skipped {} image(s) without exactly one face", v["images_skipped"]);
                }
            }
        }
        Commands::Remove { name } => {
            if proxy.remove(&name).await? {
                println!("Removed {name}");
            } else {
                bail!("{name} is not registered");
            }
        }
        Commands::List => {
            let reply = proxy.list_identities().await?;
            if cli.json {
                println!("{reply}");
            } else {
                print_identities(&serde_json::from_str(&reply)?);
            }
        }
        Commands::Checkout { name } => {
            let reply = proxy.checkout(&name).await?;
            if cli.json {
                println!("{reply}");
            } else {
                match serde_json::from_str::<AttendanceOutcome>(&reply)? {
                    AttendanceOutcome::CheckedOut { time_in, time_out } => {
                        println!("{name} checked out at {} (in since {time_in})", time_out.time());
                    }
                    other => println!("{name}: {}", other.label().replace('_', " ")),
                }
            }
        }
        Commands::Status { name } => {
            let reply = proxy.status(&name).await?;
            if cli.json {
                println!("{reply}");
            } else {
                println!("{name}: {}", describe_status(&serde_json::from_str(&reply)?));
            }
        }
        Commands::Today { present } => {
            let reply = if present { proxy.checked_in().await? } else { proxy.today().await? };
            print_records(&reply, cli.json)?;
        }
        Commands::Report { from, to, name } => {
            let reply = proxy
                .records(
                    from.as_deref().unwrap_or(""),
                    to.as_deref().unwrap_or(""),
                    name.as_deref().unwrap_or(""),
                )
                .await?;
            print_records(&reply, cli.json)?;
        }
        Commands::Summary { from, to } => {
            let reply = proxy
                .summary(from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            if cli.json {
                println!("{reply}");
            } else {
                print_summary(&serde_json::from_str(&reply)?);
            }
        }
        Commands::Start => {
            if proxy.start().await? {
                println!("Recognition started");
            } else {
                println!("Recognition already running");
            }
        }
        Commands::Stop => {
            if proxy.stop().await? {
                println!("Recognition stopped");
            } else {
                println!("Recognition was not running");
            }
        }
        Commands::Daemon => {
            let reply = proxy.daemon_status().await?;
            if cli.json {
                println!("{reply}");
            } else {
                let v: Value = serde_json::from_str(&reply)?;
                println!("presenced {}", v["version"].as_str().unwrap_or("?"));
                let running = v["running"].as_bool().unwrap_or(false);
                match v["camera"].as_str() {
                    Some(camera) if running => println!("  recognition: running ({camera})"),
                    _ => println!("  recognition: stopped"),
                }
                println!("  registered:  {}", v["identities"]);
                println!("  threshold:   {}", v["match_threshold"]);
                println!("  cooldown:    {}s", v["cooldown_secs"]);
                println!("  detector:    {}", v["detector"].as_str().unwrap_or("?"));
            }
        }
        Commands::Watch { faces } => watch(&proxy, faces).await?,
        Commands::Purge { yes } => {
            if !yes {
                bail!("refusing to purge without --yes");
            }
            let reply = proxy.purge().await?;
            if cli.json {
                println!("{reply}");
            } else {
                let v: Value = serde_json::from_str(&reply)?;
                println!(
                    "Purged {} attendance record(s), {} people, {} template(s)",
                    v["attendance"], v["employees"], v["templates"]
                );
            }
        }
    }

    Ok(())
}

async fn watch(proxy: &AttendanceProxy<'_>, faces: bool) -> Result<()> {
    let mut changes = proxy.receive_attendance_changed().await?;
    let mut seen = proxy.receive_face_seen().await?;
    tracing::debug!(faces, "subscribed to attendance signals");
    println!("Watching attendance (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            Some(signal) = changes.next() => {
                let args = signal.args()?;
                println!("{}  {:<20} {}", args.timestamp(), args.name(), args.status().replace('_', " "));
            }
            Some(signal) = seen.next(), if faces => {
                let args = signal.args()?;
                println!(
                    "    seen {:<20} {:.3} at {}x{}+{}+{}",
                    args.name(),
                    args.confidence(),
                    args.width(),
                    args.height(),
                    args.x(),
                    args.y()
                );
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn describe_status(status: &DayStatus) -> String {
    match status {
        DayStatus::NotPresent => "not present today".to_string(),
        DayStatus::CheckedIn { time_in } => format!("checked in at {time_in}"),
        DayStatus::CheckedOut { time_in, time_out } => {
            format!("checked in at {time_in}, checked out at {time_out}")
        }
    }
}

fn print_records(reply: &str, json: bool) -> Result<()> {
    if json {
        println!("{reply}");
        return Ok(());
    }
    let records: Vec<AttendanceDayRecord> = serde_json::from_str(reply)?;
    if records.is_empty() {
        println!("No attendance records");
        return Ok(());
    }
    println!("{:<20} {:<10}  {:<8}  {:<8}  STATUS", "NAME", "DATE", "IN", "OUT");
    for r in &records {
        let time_out = r.time_out.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {}  {}  {:<8}  {}",
            r.name, r.date, r.time_in, time_out, r.status
        );
    }
    Ok(())
}

fn print_identities(identities: &Value) {
    let Some(list) = identities.as_array().filter(|l| !l.is_empty()) else {
        println!("No one registered");
        return;
    };
    println!("{:<20} {:<28} {:<16} {:<16} TEMPLATE", "NAME", "EMAIL", "PHONE", "DEPARTMENT");
    for id in list {
        let text = |key: &str| id[key].as_str().unwrap_or("").to_string();
        let template = if id["has_template"].as_bool().unwrap_or(false) { "yes" } else { "no" };
        println!(
            "{:<20} {:<28} {:<16} {:<16} {template}",
            text("name"),
            text("email"),
            text("phone"),
            text("department")
        );
    }
}

fn print_summary(summary: &Value) {
    let Some(list) = summary.as_array().filter(|l| !l.is_empty()) else {
        println!("No attendance records");
        return;
    };
    println!("{:<20} {:>5}  {:<10}  LAST", "NAME", "DAYS", "FIRST");
    for s in list {
        println!(
            "{:<20} {:>5}  {:<10}  {}",
            s["name"].as_str().unwrap_or(""),
            s["days_present"],
            s["first_attendance"].as_str().unwrap_or(""),
            s["last_attendance"].as_str().unwrap_or("")
        );
    }
}
