use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clockface_core::{FeatureExtractor, StatisticalExtractor};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.clockface.Attendance1",
    default_service = "org.clockface.Attendance1",
    default_path = "/org/clockface/Attendance1",
    gen_blocking = false
)]
trait Attendance {
    fn enroll(&self, employee_id: &str, images: &[Vec<u8>]) -> zbus::Result<String>;
    fn identify(&self, image: &[u8]) -> zbus::Result<String>;
    fn check_in(
        &self,
        image: &[u8],
        timestamp: &str,
        location: &str,
        device_info: &str,
    ) -> zbus::Result<String>;
    fn check_out(&self, image: &[u8], timestamp: &str) -> zbus::Result<String>;
    fn verify(&self, image_a: &[u8], image_b: &[u8]) -> zbus::Result<String>;
    fn today_status(&self) -> zbus::Result<String>;
    fn history(&self, employee_id: &str, from: &str, to: &str) -> zbus::Result<String>;
    fn register_employee(&self, employee_id: &str) -> zbus::Result<()>;
    fn set_employee_active(&self, employee_id: &str, active: bool) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "clockface", about = "Clockface face-recognition attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll or re-enroll an employee; the first usable photo wins
    Enroll {
        employee_id: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify the employee in a photo
    Identify { image: PathBuf },
    /// Record a check-in from a photo
    CheckIn {
        image: PathBuf,
        /// Event time (RFC 3339, or local time without an offset)
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        device: Option<String>,
    },
    /// Record a check-out from a photo
    CheckOut {
        image: PathBuf,
        #[arg(long)]
        at: Option<String>,
    },
    /// Compare two photos one-to-one
    Verify { image_a: PathBuf, image_b: PathBuf },
    /// Show today's attendance totals
    Today,
    /// List attendance sessions, newest first
    History {
        #[arg(long)]
        employee: Option<String>,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last day, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
    },
    /// Add an employee to the roster without a template
    Register { employee_id: String },
    /// Mark an employee active
    Activate { employee_id: String },
    /// Mark an employee inactive; they are no longer identified
    Deactivate { employee_id: String },
    /// Show daemon status
    Status,
    /// Print a photo's feature vector without contacting the daemon
    Extract { image: PathBuf },
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Re-indent a JSON reply for the terminal.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Offline; no daemon needed.
    if let Commands::Extract { image } = &cli.command {
        let vector = StatisticalExtractor.extract(&read_image(image)?)?;
        println!("{}", serde_json::to_string(&vector.values)?);
        return Ok(());
    }

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("clockfaced is not reachable")?;
    tracing::debug!(system = cli.system, "connected to clockfaced");

    match cli.command {
        Commands::Enroll {
            employee_id,
            images,
        } => {
            let images = images
                .iter()
                .map(|path| read_image(path))
                .collect::<Result<Vec<_>>>()?;
            print_json(&proxy.enroll(&employee_id, &images).await?)?;
        }
        Commands::Identify { image } => {
            print_json(&proxy.identify(&read_image(&image)?).await?)?;
        }
        Commands::CheckIn {
            image,
            at,
            location,
            device,
        } => {
            let reply = proxy
                .check_in(
                    &read_image(&image)?,
                    at.as_deref().unwrap_or_default(),
                    location.as_deref().unwrap_or_default(),
                    device.as_deref().unwrap_or_default(),
                )
                .await?;
            print_json(&reply)?;
        }
        Commands::CheckOut { image, at } => {
            let reply = proxy
                .check_out(&read_image(&image)?, at.as_deref().unwrap_or_default())
                .await?;
            print_json(&reply)?;
        }
        Commands::Verify { image_a, image_b } => {
            let reply = proxy
                .verify(&read_image(&image_a)?, &read_image(&image_b)?)
                .await?;
            print_json(&reply)?;
        }
        Commands::Today => {
            print_json(&proxy.today_status().await?)?;
        }
        Commands::History { employee, from, to } => {
            let reply = proxy
                .history(
                    employee.as_deref().unwrap_or_default(),
                    from.as_deref().unwrap_or_default(),
                    to.as_deref().unwrap_or_default(),
                )
                .await?;
            print_json(&reply)?;
        }
        Commands::Register { employee_id } => {
            proxy.register_employee(&employee_id).await?;
            println!("registered {employee_id}");
        }
        Commands::Activate { employee_id } => {
            proxy.set_employee_active(&employee_id, true).await?;
            println!("{employee_id} is active");
        }
        Commands::Deactivate { employee_id } => {
            proxy.set_employee_active(&employee_id, false).await?;
            println!("{employee_id} is inactive");
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
        Commands::Extract { .. } => {}
    }

    Ok(())
}
