//! Standalone validator for settings files and backup archives.
//!
//! This tool checks a settings file for structural problems and can verify
//! the integrity of every archive in a backup directory.

use std::process::ExitCode;

use clap::Parser;

use marzban_control::backup::{Archive, list_archives};
use marzban_control::config::Settings;

/// Settings and backup archive validator.
#[derive(Parser, Debug)]
#[command(name = "validate_config")]
#[command(about = "Validates settings files and backup archives")]
#[command(version)]
struct Args {
    /// Path to the JSON settings file to validate.
    #[arg(short, long, default_value = "settings.json")]
    file: String,

    /// Also verify the checksums of all archives in the backup directory.
    #[arg(short, long)]
    check_backups: bool,

    /// Generate an example settings file at the specified path.
    #[arg(long)]
    generate_example: Option<String>,

    /// Show detailed information for each archive.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(output_path) = args.generate_example {
        return generate_example(&output_path);
    }

    let settings = match validate_settings(&args.file) {
        Ok(settings) => settings,
        Err(code) => return code,
    };

    if args.check_backups {
        return validate_backups(&settings, args.verbose);
    }

    ExitCode::SUCCESS
}

fn generate_example(output_path: &str) -> ExitCode {
    let example = Settings::example();

    match example.save_to_file(output_path) {
        Ok(()) => {
            println!("✓ Example settings written to: {output_path}");
            println!("\nFill in the panel URL and credentials before running the daemon.");
            println!("Secrets can also come from PANEL_PASSWORD and BOT_TOKEN in a .env file.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Failed to write example file: {e}");
            ExitCode::FAILURE
        }
    }
}

fn validate_settings(path: &str) -> Result<Settings, ExitCode> {
    println!("Validating: {path}");

    let settings = match Settings::load_from_file(path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("✗ Failed to load settings: {e}");
            return Err(ExitCode::FAILURE);
        }
    };

    if let Err(e) = settings.validate() {
        println!("✗ Validation failed: {e}");
        return Err(ExitCode::FAILURE);
    }

    println!("✓ Settings are valid");
    println!("  Panel:           {}", settings.panel_base_url());
    println!("  Database:        {}", settings.database_path.display());
    println!("  Backup dir:      {}", settings.backup_dir.display());
    println!(
        "  Schedule:        sync every {} min, backup every {} min",
        settings.sync_interval_mins, settings.backup_interval_mins
    );
    println!("  Retention:       {} archives", settings.retention_count);

    Ok(settings)
}

fn validate_backups(settings: &Settings, verbose: bool) -> ExitCode {
    println!("\nChecking archives in: {}", settings.backup_dir.display());

    let archives = match list_archives(&settings.backup_dir) {
        Ok(archives) => archives,
        Err(e) => {
            eprintln!("✗ Failed to list archives: {e}");
            return ExitCode::FAILURE;
        }
    };

    if archives.is_empty() {
        println!("  No archives found.");
        return ExitCode::SUCCESS;
    }

    let mut errors = 0;
    for info in &archives {
        let result = Archive::load(&info.path).and_then(|a| a.validate());
        match result {
            Ok(()) => {
                if verbose {
                    println!("  ✓ {} ({} bytes)", info.id, info.file_size);
                }
            }
            Err(e) => {
                errors += 1;
                println!("  ✗ {}: {e}", info.id);
            }
        }
    }

    let total = archives.len();
    if errors == 0 {
        println!("✓ All {total} archives verified");
        ExitCode::SUCCESS
    } else {
        println!("✗ {errors} of {total} archives failed verification");
        ExitCode::FAILURE
    }
}
