//! Project initialization: `patchwork init`.

use anyhow::Result;

use super::Status;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<Status> {
    use patchwork::init::{init_project, is_initialized};

    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized patchwork state at {}",
            result.state_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .patchwork/");
        println!("  ├── patchwork.toml   # Configuration (`patchwork config show`)");
        println!("  ├── order.manifest   # Optional total order of unit ids");
        println!("  ├── queue/           # queued, staged, active, completed, failed");
        println!("  ├── blocked/         # Quarantine markers");
        println!("  ├── control/         # SLA halt and backoff records");
        println!("  ├── integrity/       # Checksum manifest and signature");
        println!("  ├── reports/         # Machine-readable reports per component");
        println!("  └── logs/            # Daily rolling log files");
        println!();
        println!("Next steps:");
        println!("  1. Run `patchwork submit <unit.json>` to queue work");
        println!("  2. Run `patchwork run --inline` to execute it");
    } else if was_initialized {
        println!(
            "Patchwork already initialized at {}",
            result.state_dir.display()
        );
        if result.written.is_empty() {
            println!("Directory structure verified.");
        }
    }
    for path in &result.written {
        println!("  wrote {}", path.display());
    }

    Ok(Status::Ok)
}
