use std::path::PathBuf;
use std::sync::Arc;

use microbe_insights::config::Configuration;
use microbe_insights::error::AppError;
use microbe_insights::intake::source::DefaultSourceFactory;
use microbe_insights::pipeline::stage::{MicroplasticDetector, PlanktonClassifier};
use microbe_insights::pipeline::{AnalysisPipeline, ImageStore};
use microbe_insights::{CameraSessionManager, CoordinatorBuilder, ReportMetadata, ReportStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    analyze: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self, AppError> {
        let mut args = Args::default();
        let mut raw = std::env::args().skip(1);
        while let Some(flag) = raw.next() {
            let value = raw
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| AppError::Pipeline(format!("{flag} expects a path")))?;
            match flag.as_str() {
                "--config" => args.config = Some(value),
                "--analyze" => args.analyze = Some(value),
                other => return Err(AppError::Pipeline(format!("unknown argument '{other}'"))),
            }
        }
        Ok(args)
    }
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = Args::parse()?;
    let configuration = Configuration::load(args.config.as_deref())?;
    init_logging(&configuration.logging.filter);

    let store = ReportStore::open(&configuration.storage.database_path).await?;
    let pipeline = AnalysisPipeline::builder()
        .microplastic(Arc::new(MicroplasticDetector::new()))
        .plankton(Arc::new(PlanktonClassifier::new()))
        .stage_timeout(configuration.inference.stage_timeout())
        .images(ImageStore::new(&configuration.storage.capture_dir))
        .store(store)
        .annotate(configuration.storage.annotate)
        .roi_crops(configuration.storage.roi_crops)
        .build()?;
    let factory = Arc::new(DefaultSourceFactory::from_settings(&configuration.camera));
    let sessions = Arc::new(CameraSessionManager::from_settings(factory, &configuration.camera));

    let coordinator = CoordinatorBuilder::new(&configuration)
        .sessions(sessions)
        .pipeline(Arc::new(pipeline))
        .build()?;

    let report = match args.analyze {
        Some(path) => {
            let bytes = tokio::fs::read(&path).await?;
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let frame = coordinator.upload(bytes, file_name.clone()).await?;
            coordinator.analyze(frame.frame_id, ReportMetadata::new(file_name)).await?
        }
        None => {
            let slide_name = format!("capture-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S"));
            coordinator.capture_and_analyze(ReportMetadata::new(slide_name)).await?
        }
    };
    tracing::info!(
        report_id = report.id,
        microplastics_present = report.microplastics_present(),
        image = %report.image_path.display(),
        "Analysis complete"
    );

    coordinator.shutdown().await
}
