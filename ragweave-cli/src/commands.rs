//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use ragweave_core::{ConfigError, ResolvedCredentials, env_lookup};
use ragweave_rag::evaluation::{Distribution, RelevanceKey, evaluate_retrieval};
use ragweave_rag::pipeline::build_index;
use ragweave_rag::{
    PipelineComponents, QueryMode, RagConfig, RagPipeline, RetrievalPipeline, Retriever, Testset,
    TestsetConfig, TestsetGenerator, load_config,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where configuration comes from for this invocation.
pub struct Settings<'a> {
    pub workspace: PathBuf,
    pub config_file: Option<PathBuf>,
    pub overrides: Vec<(&'a str, toml::Value)>,
}

impl Settings<'_> {
    fn load(&self) -> anyhow::Result<RagConfig> {
        load_config(
            Some(&self.workspace),
            self.config_file.as_deref(),
            &self.overrides,
        )
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, settings: &Settings<'_>) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, settings),
        Commands::Index => handle_index(settings.load()?).await,
        Commands::Query {
            question,
            mode,
            sources,
            json,
        } => {
            let mut config = settings.load()?;
            if let Some(mode) = mode {
                config.query.mode = mode.parse::<QueryMode>()?;
            }
            handle_query(config, &question, sources, json).await
        }
        Commands::Retrieve { query, top_k } => {
            let mut config = settings.load()?;
            if let Some(k) = top_k {
                config.retrieval.top_k = k;
            }
            handle_retrieve(config, &query).await
        }
        Commands::Testset {
            output,
            size,
            distribution,
            seed,
        } => {
            let mut testset_config = TestsetConfig {
                test_size: size,
                seed,
                ..TestsetConfig::default()
            };
            if let Some(shares) = distribution {
                testset_config.distribution = parse_distribution(&shares)?;
            }
            handle_testset(settings.load()?, testset_config, &output).await
        }
        Commands::Evaluate {
            testset,
            by_document,
            output,
        } => {
            let key = if by_document {
                RelevanceKey::Document
            } else {
                RelevanceKey::Node
            };
            handle_evaluate(settings.load()?, &testset, key, output.as_deref()).await
        }
    }
}

/// Shares of simple, reasoning and multi-context questions, in that order.
fn parse_distribution(shares: &[f32]) -> Result<Distribution, ConfigError> {
    let [simple, reasoning, multi_context] = shares[..] else {
        return Err(ConfigError::invalid(format!(
            "--distribution takes exactly three shares (simple,reasoning,multi_context), got {}",
            shares.len()
        )));
    };
    let distribution = Distribution {
        simple,
        reasoning,
        multi_context,
    };
    distribution.validate()?;
    Ok(distribution)
}

fn handle_config(action: ConfigAction, settings: &Settings<'_>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = settings.workspace.join(".ragweave");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RagConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = settings.load()?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            for warning in config.warnings() {
                eprintln!("warning: {}", warning);
            }
            Ok(())
        }
    }
}

/// Credentials for indexing and retrieval: the embedder, plus the LLM when
/// fusion generates query variants.
fn retrieval_components(config: &RagConfig) -> anyhow::Result<PipelineComponents> {
    let mut requirements: Vec<_> = config
        .embedding
        .credential_requirement()
        .into_iter()
        .collect();
    let needs_llm = config.retrieval.num_queries > 1;
    if needs_llm {
        requirements.extend(config.llm.credential_requirement());
    }
    let credentials = ResolvedCredentials::resolve(&requirements, env_lookup)?;
    let components = if needs_llm {
        PipelineComponents::from_config(config, &credentials)?
    } else {
        PipelineComponents::embedding_only(config, &credentials)?
    };
    Ok(components)
}

async fn handle_index(config: RagConfig) -> anyhow::Result<()> {
    config.validate()?;
    let credentials = ResolvedCredentials::resolve(
        config.embedding.credential_requirement().iter(),
        env_lookup,
    )?;
    let components = PipelineComponents::embedding_only(&config, &credentials)?;
    let store = build_index(&config, components.embedder).await?;

    let action = if store.loaded { "Loaded" } else { "Built" };
    println!("{} index at {}", action, config.index.persist_dir.display());
    println!("  nodes:       {}", store.docstore.len());
    println!("  leaves:      {}", store.index.len());
    println!(
        "  embedder:    {} ({} dims)",
        store.manifest.embedder, store.manifest.dimension
    );
    let fingerprint = &store.manifest.fingerprint;
    println!("  fingerprint: {}", &fingerprint[..12.min(fingerprint.len())]);
    println!("  built at:    {}", store.manifest.built_at.to_rfc3339());
    Ok(())
}

async fn handle_query(
    config: RagConfig,
    question: &str,
    sources: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let credentials = config.resolve_credentials(env_lookup)?;
    let components = PipelineComponents::from_config(&config, &credentials)?;
    let pipeline = RagPipeline::build(&config, components, &credentials).await?;
    let response = pipeline.query(question).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    println!("{}", response);
    if let Some(length) = sources
        && !response.sources.is_empty()
    {
        println!("\n{}", response.formatted_sources(length));
    }
    Ok(())
}

async fn handle_retrieve(config: RagConfig, query: &str) -> anyhow::Result<()> {
    let components = retrieval_components(&config)?;
    let pipeline = RetrievalPipeline::build(&config, &components).await?;
    let hits = pipeline.retrieve(query).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for hit in hits {
        println!(
            "#{} [{:.4}] {} ({})",
            hit.rank + 1,
            hit.score,
            hit.node.id,
            hit.node.document_id
        );
        println!("    {}", hit.node.text.replace('\n', " "));
    }
    Ok(())
}

async fn handle_testset(
    config: RagConfig,
    testset_config: TestsetConfig,
    output: &Path,
) -> anyhow::Result<()> {
    config.validate()?;
    let credentials = ResolvedCredentials::resolve(
        config
            .embedding
            .credential_requirement()
            .iter()
            .chain(config.llm.credential_requirement().iter()),
        env_lookup,
    )?;
    let components = PipelineComponents::from_config(&config, &credentials)?;
    let Some(llm) = components.llm.clone() else {
        anyhow::bail!("test set generation needs an LLM provider");
    };
    let store = build_index(&config, components.embedder).await?;

    // One provider plays both generator and critic.
    let generator = TestsetGenerator::new(llm.clone(), llm, testset_config)?;
    let testset = generator.generate(store.docstore.nodes()).await?;
    testset.save(output).await?;
    println!("Wrote {} samples to {}", testset.len(), output.display());
    Ok(())
}

async fn handle_evaluate(
    config: RagConfig,
    testset_path: &Path,
    key: RelevanceKey,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let testset = Testset::load(testset_path).await?;
    let components = retrieval_components(&config)?;
    let pipeline = RetrievalPipeline::build(&config, &components).await?;
    let fusion: Arc<dyn Retriever> = pipeline.fusion();
    let report = evaluate_retrieval(fusion.as_ref(), &testset, key).await?;

    println!("Evaluated {} queries", report.test_cases_run);
    println!("  hit rate:  {:.3}", report.metrics.hit_rate);
    println!("  MRR:       {:.3}", report.metrics.mrr);
    println!("  precision: {:.3}", report.metrics.precision);
    println!("  recall:    {:.3}", report.metrics.recall);
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_vec_pretty(&report)?)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}
