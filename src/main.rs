use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use log::error;
use serde::Serialize;

use ine_reader::models::{CanonicalTemplate, FieldRecord};
use ine_reader::processing::{merge_records, Aligner, FieldParser, ImageProcessor};
use ine_reader::{ExtractorConfig, IdError};

#[derive(Parser)]
#[command(name = "ine-reader", version, about = "Read the front of an INE voter card")]
struct Cli {
    /// JSON file overriding the default thresholds
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a scan against the template and save the warped image
    Align {
        #[arg(long)]
        scan: PathBuf,
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Parse recognised text (one line per line) into fields
    Parse {
        #[arg(long)]
        input: PathBuf,
    },
    /// Merge a plain and an enhanced field record
    Merge {
        #[arg(long)]
        plain: PathBuf,
        #[arg(long)]
        enhanced: PathBuf,
    },
    /// Full pipeline: align, OCR, parse and reconcile
    Extract {
        #[arg(long)]
        scan: PathBuf,
        #[arg(long)]
        template: PathBuf,
        /// Run the enhanced pass even if the plain one filled every field
        #[arg(long)]
        force: bool,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), IdError> {
    let config = match &cli.config {
        Some(path) => ExtractorConfig::from_json_file(path)?,
        None => ExtractorConfig::default(),
    };

    match cli.command {
        Command::Align { scan, template, out } => {
            let scan = ImageProcessor::load(&scan)?;
            let template = CanonicalTemplate::load(&template)?;
            let registration = Aligner::from_config(&config)
                .align(&scan, template.image())
                .into_result()?;
            registration
                .image
                .save(&out)
                .map_err(|e| IdError::ImageProcessing(format!("Failed to save {:?}: {}", out, e)))?;
            println!(
                "Aligned with the {} strategy (inlier ratio {:.2}) -> {}",
                registration.strategy,
                registration.inlier_ratio,
                out.display()
            );
            Ok(())
        }
        Command::Parse { input } => {
            let text = fs::read_to_string(&input)?;
            let record = FieldParser::new(config.parser).parse_text(&text);
            print_json(&record)
        }
        Command::Merge { plain, enhanced } => {
            let plain = read_record(&plain)?;
            let enhanced = read_record(&enhanced)?;
            print_json(&merge_records(&plain, &enhanced))
        }
        Command::Extract {
            scan,
            template,
            force,
            out_dir,
        } => {
            let mut config = config;
            config.force_enhanced |= force;
            extract(config, &scan, &template, &out_dir)
        }
    }
}

#[cfg(feature = "tesseract")]
fn extract(
    config: ExtractorConfig,
    scan: &Path,
    template: &Path,
    out_dir: &Path,
) -> Result<(), IdError> {
    use chrono::Local;
    use ine_reader::processing::ocr::TesseractRecognizer;
    use ine_reader::IneExtractor;

    let template = CanonicalTemplate::load(template)?;
    let extractor = IneExtractor::new(TesseractRecognizer::default(), config);
    let report = extractor.extract_path(scan, &template)?;

    fs::create_dir_all(out_dir)?;
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    write_json(&out_dir.join(format!("JSON_normal_{}.json", stamp)), &report.plain)?;
    if let Some(enhanced) = &report.enhanced {
        write_json(&out_dir.join(format!("JSON_preproc_{}.json", stamp)), enhanced)?;
    }
    let final_path = out_dir.join(format!("JSON_final_{}.json", stamp));
    write_json(&final_path, &report.merged)?;
    log::info!("alignment: {:?}", report.alignment);
    println!("Final record written to {}", final_path.display());
    print_json(&report.merged)
}

#[cfg(not(feature = "tesseract"))]
fn extract(
    _config: ExtractorConfig,
    _scan: &Path,
    _template: &Path,
    _out_dir: &Path,
) -> Result<(), IdError> {
    Err(IdError::Config(
        "the extract command needs the `tesseract` feature".to_string(),
    ))
}

fn read_record(path: &Path) -> Result<FieldRecord, IdError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| IdError::Config(format!("Invalid record in {:?}: {}", path, e)))
}

#[cfg(feature = "tesseract")]
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IdError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| IdError::Config(e.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), IdError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| IdError::Config(e.to_string()))?;
    println!("{}", json);
    Ok(())
}
