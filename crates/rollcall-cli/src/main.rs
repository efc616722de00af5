use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rollcall_core::encode;
use rollcall_vision::{
    default_model_dir, gray_from_image, DetectorConfig, FrameDetector, GrayFrame, ModelPaths,
    OnnxFaceModel,
};

// `#[zbus::proxy]` generates `RollcallProxy` (async) from this trait.
#[zbus::proxy(
    interface = "org.classroom.Rollcall1",
    default_service = "org.classroom.Rollcall1",
    default_path = "/org/classroom/Rollcall1"
)]
trait Rollcall {
    async fn start_scan(&self, class_id: &str) -> zbus::Result<String>;
    async fn scan_status(&self) -> zbus::Result<String>;
    async fn mark_student(&self, student_id: &str, mark: &str) -> zbus::Result<String>;
    async fn complete_scan(&self) -> zbus::Result<String>;
    async fn cancel_scan(&self) -> zbus::Result<bool>;
    async fn start_enrollment(&self, class_id: &str, student_name: &str) -> zbus::Result<String>;
    async fn enroll_status(&self) -> zbus::Result<String>;
    async fn advance_enrollment(&self) -> zbus::Result<String>;
    async fn confirm_enrollment(&self) -> zbus::Result<String>;
    async fn reset_enrollment(&self) -> zbus::Result<String>;
    async fn cancel_enrollment(&self) -> zbus::Result<bool>;
    async fn create_class(&self, name: &str) -> zbus::Result<String>;
    async fn list_classes(&self) -> zbus::Result<String>;
    async fn roster(&self, class_id: &str) -> zbus::Result<String>;
    async fn attendance(&self, class_id: &str, date: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Live attendance scan control
    Scan {
        #[command(subcommand)]
        action: ScanAction,
    },
    /// Enroll a new student
    Enroll {
        #[command(subcommand)]
        action: EnrollAction,
    },
    /// Class and roster management
    Class {
        #[command(subcommand)]
        action: ClassAction,
    },
    /// List available camera devices
    Devices,
    /// Compute and print the encoded descriptor for a still image
    EncodeImage {
        /// Path to the image file
        path: String,
        /// Directory containing the ONNX models
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ScanAction {
    /// Start a scan for a class
    Start { class_id: String },
    /// Show the running scan's status
    Status,
    /// Manually mark a student (present, absent, or unset)
    Mark { student_id: String, mark: String },
    /// Finish the scan and save attendance
    Complete,
    /// Abandon the scan without saving
    Cancel,
}

#[derive(Subcommand)]
enum EnrollAction {
    /// Begin enrolling a student into a class
    Start {
        class_id: String,
        student_name: String,
    },
    /// Show the enrollment flow's status
    Status,
    /// Advance to the next step (starts positioning, takes captures)
    Advance,
    /// Confirm and save the reviewed capture
    Confirm,
    /// Restart the flow from the info step
    Reset,
    /// Abandon the enrollment
    Cancel,
}

#[derive(Subcommand)]
enum ClassAction {
    /// Create a class
    Create { name: String },
    /// List all classes
    List,
    /// Show a class roster
    Roster { class_id: String },
    /// Show saved attendance for a date (YYYY-MM-DD)
    Attendance { class_id: String, date: String },
}

async fn proxy() -> Result<RollcallProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus (is rollcalld running?)")?;
    RollcallProxy::new(&conn)
        .await
        .context("creating daemon proxy")
}

/// Re-indent a JSON reply for terminal output; passes non-JSON through.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { action } => {
            let proxy = proxy().await?;
            let reply = match action {
                ScanAction::Start { class_id } => proxy.start_scan(&class_id).await?,
                ScanAction::Status => proxy.scan_status().await?,
                ScanAction::Mark { student_id, mark } => {
                    proxy.mark_student(&student_id, &mark).await?
                }
                ScanAction::Complete => proxy.complete_scan().await?,
                ScanAction::Cancel => {
                    let cancelled = proxy.cancel_scan().await?;
                    println!("{}", if cancelled { "scan cancelled" } else { "no active scan" });
                    return Ok(());
                }
            };
            println!("{}", pretty(&reply));
        }
        Commands::Enroll { action } => {
            let proxy = proxy().await?;
            let reply = match action {
                EnrollAction::Start {
                    class_id,
                    student_name,
                } => proxy.start_enrollment(&class_id, &student_name).await?,
                EnrollAction::Status => proxy.enroll_status().await?,
                EnrollAction::Advance => proxy.advance_enrollment().await?,
                EnrollAction::Confirm => {
                    let student_id = proxy.confirm_enrollment().await?;
                    println!("enrolled student {student_id}");
                    return Ok(());
                }
                EnrollAction::Reset => proxy.reset_enrollment().await?,
                EnrollAction::Cancel => {
                    let cancelled = proxy.cancel_enrollment().await?;
                    println!(
                        "{}",
                        if cancelled { "enrollment cancelled" } else { "no active enrollment" }
                    );
                    return Ok(());
                }
            };
            println!("{}", pretty(&reply));
        }
        Commands::Class { action } => {
            let proxy = proxy().await?;
            match action {
                ClassAction::Create { name } => {
                    let id = proxy.create_class(&name).await?;
                    println!("created class {id}");
                }
                ClassAction::List => println!("{}", pretty(&proxy.list_classes().await?)),
                ClassAction::Roster { class_id } => {
                    println!("{}", pretty(&proxy.roster(&class_id).await?))
                }
                ClassAction::Attendance { class_id, date } => {
                    println!("{}", pretty(&proxy.attendance(&class_id, &date).await?))
                }
            }
        }
        Commands::Devices => {
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("no capture devices found");
            }
            for dev in devices {
                println!("{}\t{} ({})", dev.path, dev.name, dev.driver);
            }
        }
        Commands::EncodeImage { path, model_dir } => {
            let encoded = encode_image(&path, model_dir.as_deref())?;
            println!("{encoded}");
        }
        Commands::Status => {
            let proxy = proxy().await?;
            println!("{}", pretty(&proxy.status().await?));
        }
    }

    Ok(())
}

/// Run the face pipeline over a still image file and return the encoded
/// descriptor of the most confident face.
fn encode_image(path: &str, model_dir: Option<&str>) -> Result<String> {
    let img = image::open(path).with_context(|| format!("opening image {path}"))?;
    let (gray, width, height) = gray_from_image(&img);

    let dir = model_dir
        .map(std::path::PathBuf::from)
        .unwrap_or_else(default_model_dir);
    let paths = ModelPaths::in_dir(&dir);
    let model = OnnxFaceModel::load(&paths.detect, &paths.embed)
        .with_context(|| format!("loading models from {}", dir.display()))?;
    let mut detector = FrameDetector::new(Box::new(model), DetectorConfig::default());

    let face = detector
        .detect_one(GrayFrame {
            data: &gray,
            width,
            height,
        })
        .context("running detection")?
        .context("no face found in image")?;

    encode(&face.descriptor).context("encoding descriptor")
}
