use animal_core::labels::{FEMALE_PREFERENCE, FORBIDDEN_PAIRS, MALE_PREFERENCE};
use animal_core::normalizer::FACE_INPUT_SIZE;
use animal_core::oracle::{EmbeddingOutput, InputLayout, ScoreOracle};
use animal_core::settings::{OracleKind, PipelineSettings};
use animal_core::{Animal, GenderHint};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod prototypes;

#[derive(Parser)]
#[command(name = "animal", about = "Animal-face archetype classifier CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a face photo
    Classify {
        /// Image file (JPEG or PNG)
        image: PathBuf,
        /// Gender hint: male or female
        #[arg(short, long)]
        gender: Option<String>,
        /// Send the image to animald instead of running models locally
        #[arg(long)]
        remote: bool,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Build mean-embedding prototypes from a labelled dataset
    Prototypes {
        /// CSV with an `image` column and one 0/1 column per label
        #[arg(long)]
        labels: PathBuf,
        /// Directory holding the cropped dataset images
        #[arg(long)]
        images: PathBuf,
        /// Output JSON path
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Print the label universe and selection rules
    Labels,
    /// Fetch a stored result from animald
    Get {
        /// Result id returned by classify
        id: String,
    },
    /// Show daemon status
    Status,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory holding the default model files
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Oracle variant: classifier or embedding
    #[arg(long, default_value = "classifier")]
    oracle: OracleKind,
    #[arg(long)]
    detector_model: Option<PathBuf>,
    #[arg(long)]
    classifier_model: Option<PathBuf>,
    /// Teachable-Machine style labels.txt for the classifier
    #[arg(long)]
    labels_file: Option<PathBuf>,
    #[arg(long)]
    embedding_model: Option<PathBuf>,
    /// Prototype JSON for the embedding variant
    #[arg(long)]
    prototypes: Option<PathBuf>,
    /// Embedding output tensor, by index or name
    #[arg(long)]
    embedding_output: Option<String>,
    /// Model input layout: nhwc or nchw
    #[arg(long, default_value = "nhwc")]
    layout: InputLayout,
    /// Disable the similarity cap
    #[arg(long)]
    no_cap: bool,
}

impl ModelArgs {
    fn settings(&self) -> PipelineSettings {
        let dir = self
            .model_dir
            .clone()
            .or_else(|| std::env::var_os("ANIMAL_MODEL_DIR").map(PathBuf::from))
            .unwrap_or_else(animal_core::default_model_dir);
        let mut s = PipelineSettings::in_dir(dir, self.oracle);
        if let Some(p) = &self.detector_model {
            s.detector_model = p.clone();
        }
        if let Some(p) = &self.classifier_model {
            s.classifier_model = p.clone();
        }
        if let Some(p) = &self.embedding_model {
            s.embedding_model = p.clone();
        }
        if let Some(p) = &self.prototypes {
            s.prototypes = p.clone();
        }
        if let Some(o) = &self.embedding_output {
            s.embedding_output = EmbeddingOutput::parse(o);
        }
        s.labels = self.labels_file.clone();
        s.layout = self.layout;
        if self.no_cap {
            s.similarity_cap = None;
        }
        s
    }
}

#[zbus::proxy(
    interface = "org.animalface.Classifier1",
    default_service = "org.animalface.Classifier1",
    default_path = "/org/animalface/Classifier1"
)]
trait Classifier1 {
    fn classify(&self, image: &[u8], gender: &str) -> zbus::Result<String>;
    fn get_result(&self, id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

async fn daemon() -> Result<Classifier1Proxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    Ok(Classifier1Proxy::new(&conn).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Classify { image, gender, remote, models } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            if remote {
                let json = daemon()
                    .await?
                    .classify(&bytes, gender.as_deref().unwrap_or_default())
                    .await?;
                println!("{json}");
            } else {
                let gender = GenderHint::from(gender.as_deref());
                let settings = models.settings();
                let registry = settings.load_registry()?;
                let mut classifier = settings.build(registry)?;
                tracing::debug!(domain = ?classifier.oracle().domain(), "pipeline ready");
                let result = classifier.classify(&bytes, gender)?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
        Commands::Prototypes { labels, images, out, models } => {
            let text = std::fs::read_to_string(&labels)
                .with_context(|| format!("failed to read {}", labels.display()))?;
            let rows = prototypes::parse_dataset(&text)?;
            let settings = models.settings();
            let mut embedder = settings.load_embedder()?;
            println!("Embedding {} images from {}", rows.len(), images.display());

            let (registry, stats) = prototypes::build_prototypes(
                &mut embedder,
                &rows,
                &images,
                FACE_INPUT_SIZE,
                animal_core::normalizer::PixelNormalization::embedding_default(),
            )?;
            std::fs::write(&out, registry.to_json()?)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "Wrote {} prototypes ({} dims) to {}; {} images embedded, {} skipped",
                registry.len(),
                registry.dim(),
                out.display(),
                stats.embedded,
                stats.skipped
            );
        }
        Commands::Labels => {
            for (i, label) in Animal::ALL.iter().enumerate() {
                println!("{i:>2} {:<9} {}", label.as_str(), label.message());
            }
            println!();
            println!("male preference:   {}", join(&MALE_PREFERENCE));
            println!("female preference: {}", join(&FEMALE_PREFERENCE));
            println!("forbidden pairs:");
            for (a, b) in FORBIDDEN_PAIRS {
                println!("  {a} + {b}");
            }
        }
        Commands::Get { id } => {
            println!("{}", daemon().await?.get_result(&id).await?);
        }
        Commands::Status => match daemon().await {
            Ok(proxy) => println!("{}", proxy.status().await?),
            Err(e) => println!("animald: not connected ({e})"),
        },
    }

    Ok(())
}

fn join(labels: &[Animal]) -> String {
    labels.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
}
