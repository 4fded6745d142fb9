use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use imgmute::config::MuterConfig;
use imgmute::core::extractor::PostExtractor;
use imgmute::core::hash::{similarity, Fingerprint, PerceptualHasher};
use imgmute::core::oracle::{HttpImageSource, PairRequest, SimilarityOracle};
use imgmute::core::page::{ElementSpec, Page};
use imgmute::core::watcher::{Decision, FeedWatcher, PostDecision, PostState};
use imgmute::database::repositories::{ComparisonRepository, SettingsRepository};
use imgmute::database::{default_store_path, SharedStore, SledStore};
use imgmute::services::client::{HttpOracle, Oracle, SimilarityClient};
use imgmute::services::server;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "imgmute", version, about = "Hide feed posts that show images you muted")]
struct Cli {
    /// JSON config file (defaults apply to missing fields)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store directory (default: platform data dir)
    #[arg(long, global = true, value_name = "DIR")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the similarity service
    Serve {
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:3000")]
        bind: SocketAddr,
    },

    /// Ask the similarity service to score image pairs
    Compare {
        #[arg(required_unless_present = "pairs", requires = "img2")]
        img1: Option<String>,
        #[arg(requires = "img1")]
        img2: Option<String>,
        /// JSON list of `{"img1", "img2", "cacheKey"?}` objects
        #[arg(long, value_name = "FILE", conflicts_with_all = ["img1", "img2"])]
        pairs: Option<PathBuf>,
        /// Service base URL (default: from config)
        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },

    /// Fingerprint local images and list look-alike pairs
    Hash {
        /// Image file or directory to scan
        #[arg(short, long, value_name = "PATH")]
        path: PathBuf,
        /// Minimum similarity to report (default: from config)
        #[arg(long)]
        threshold: Option<f64>,
        /// Score every image against this base64 fingerprint instead of
        /// against each other
        #[arg(long, value_name = "FINGERPRINT")]
        against: Option<String>,
    },

    /// Manage the muted image set and stored state
    Mute {
        #[command(subcommand)]
        command: MuteCmd,
    },

    /// Run the watcher over a saved feed and print each post's decision
    Scan {
        /// JSON list of post elements
        #[arg(long, value_name = "FILE")]
        feed: PathBuf,
        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum MuteCmd {
    /// Replace the muted image set
    Set {
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },
    /// Show the muted image set, the enabled flag and cache size
    Show,
    Enable,
    Disable,
    /// Forget every cached comparison
    ClearCache {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MuterConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MuterConfig::default(),
    };

    match cli.command {
        Commands::Serve { bind } => {
            let oracle = SimilarityOracle::new(Arc::new(HttpImageSource::new(http_client(&config)?)));
            server::serve(bind, Arc::new(oracle))
                .await
                .with_context(|| format!("Server on {} failed", bind))?;
        }

        Commands::Compare {
            img1,
            img2,
            pairs,
            server,
        } => {
            let base_url = server.unwrap_or_else(|| config.server_url.clone());
            let oracle = HttpOracle::new(http_client(&config)?, base_url);

            if let Some(file) = pairs {
                let raw = fs::read_to_string(&file)
                    .with_context(|| format!("Could not read {}", file.display()))?;
                let requests: Vec<PairRequest> = serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid pair list in {}", file.display()))?;
                println!("▶ Comparing {} pairs…", requests.len());
                let started = Instant::now();
                let results = oracle.compare_batch(requests).await?;
                println!("⏱ batch comparison took {:.2?}", started.elapsed());
                for result in results {
                    println!(
                        "   {} {} vs {}: {:.3}",
                        verdict(result.similarity, config.similarity_threshold),
                        result.img1,
                        result.img2,
                        result.similarity
                    );
                }
            } else if let (Some(img1), Some(img2)) = (img1, img2) {
                let score = oracle.compare(&img1, &img2).await?;
                println!(
                    "{} similarity {:.3} (threshold {})",
                    verdict(score, config.similarity_threshold),
                    score,
                    config.similarity_threshold
                );
            }
        }

        Commands::Hash {
            path,
            threshold,
            against,
        } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            if let Some(encoded) = against {
                let target = Fingerprint::from_base64(&encoded)
                    .with_context(|| format!("Invalid fingerprint {:?}", encoded))?;
                println!("▶ Matching images in {} against {}", path.display(), encoded);
                let matches = find_matching(&path, &target, threshold)?;
                if matches.is_empty() {
                    println!("No images at or above {}.", threshold);
                } else {
                    for (file, score) in matches {
                        println!("   {:.3}  {}", score, file.display());
                    }
                }
                return Ok(());
            }

            println!("▶ Fingerprinting images in: {}", path.display());
            let matches = find_similar(&path, threshold)?;
            if matches.is_empty() {
                println!("No pairs at or above {}.", threshold);
            } else {
                println!("Found {} pair(s) at or above {}:", matches.len(), threshold);
                for (a, b, score) in matches {
                    println!("   {:.3}  {} ↔ {}", score, a.display(), b.display());
                }
            }
        }

        Commands::Mute { command } => {
            let store = open_store(cli.store.as_deref())?;
            let settings = SettingsRepository::new(store.clone());
            let cache = ComparisonRepository::new(store.clone());

            match command {
                MuteCmd::Set { urls } => {
                    settings.save_reference_set(&urls)?;
                    println!("✅ Saved {} muted image(s)", urls.len());
                }
                MuteCmd::Show => {
                    let urls = settings.load_reference_set()?;
                    let state = if settings.load_enabled()? { "enabled" } else { "disabled" };
                    println!("🔇 Muting is {}", state);
                    println!("🗂️  {} muted image(s):", urls.len());
                    for url in urls {
                        println!("   ▶ {}", url);
                    }
                    println!("💾 {} cached comparison(s)", cache.count()?);
                }
                MuteCmd::Enable => {
                    settings.save_enabled(true)?;
                    println!("✅ Muting enabled");
                }
                MuteCmd::Disable => {
                    settings.save_enabled(false)?;
                    println!("✅ Muting disabled");
                }
                MuteCmd::ClearCache { yes } => {
                    let count = cache.count()?;
                    let confirmed = yes
                        || Confirm::new()
                            .with_prompt(format!("Delete {} cached comparison(s)?", count))
                            .default(false)
                            .interact()?;
                    if confirmed {
                        let removed = cache.clear()?;
                        println!("🗑️  Removed {} cached comparison(s)", removed);
                    } else {
                        println!("Nothing removed.");
                    }
                }
            }
            store.flush()?;
        }

        Commands::Scan { feed, server } => {
            let store = open_store(cli.store.as_deref())?;
            let base_url = server.unwrap_or_else(|| config.server_url.clone());
            scan_feed(&feed, &config, store.clone(), base_url).await?;
            store.flush()?;
        }
    }

    Ok(())
}

fn http_client(config: &MuterConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")
}

fn open_store(path: Option<&Path>) -> Result<SharedStore> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_store_path()?,
    };
    let store = SledStore::open(&path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn verdict(score: f64, threshold: f64) -> &'static str {
    if score >= threshold { "🔇" } else { "👁" }
}

/// Load the feed into a fresh page, let the watcher decide every post, and
/// print the outcome.
async fn scan_feed(feed: &Path, config: &MuterConfig, store: SharedStore, base_url: String) -> Result<()> {
    let raw = fs::read_to_string(feed).with_context(|| format!("Could not read {}", feed.display()))?;
    let posts: Vec<ElementSpec> =
        serde_json::from_str(&raw).with_context(|| format!("Invalid feed in {}", feed.display()))?;

    let settings = SettingsRepository::new(store.clone());
    if !settings.load_enabled()? {
        println!("⚠️  Muting is disabled; run `imgmute mute enable` first.");
        return Ok(());
    }

    let extractor = PostExtractor::new(config.extractor.clone());
    let mut page = Page::new();
    let root = page.root();
    for post in posts {
        page.append(root, post);
    }
    let total = extractor.posts_in(&page, root).len();
    if total == 0 {
        println!("No posts found in {}.", feed.display());
        return Ok(());
    }
    println!("▶ Scanning {} posts against {} muted image(s)…", total, settings.load_reference_set()?.len());

    let page = page.into_shared();
    let oracle: Arc<dyn Oracle> = Arc::new(HttpOracle::new(http_client(config)?, base_url));
    let client = SimilarityClient::new(oracle, store.clone(), config.max_concurrent_requests);
    let watcher = FeedWatcher::new(page, extractor, Arc::new(client), store, config);
    let mut reports = watcher.subscribe();
    let watcher = watcher.spawn();

    let started = Instant::now();
    let mut decisions: Vec<PostDecision> = Vec::new();
    let mut skipped = 0;
    loop {
        let report = reports.recv().await.context("Watcher stopped unexpectedly")?;
        skipped += report.skipped;
        decisions.extend(report.decisions);

        let settled = watcher
            .post_states()
            .await
            .values()
            .all(|s| matches!(s, PostState::Decided(_) | PostState::Skipped));
        if settled {
            break;
        }
    }
    watcher.shutdown().await;

    for decision in &decisions {
        let icon = match decision.decision {
            Decision::Muted => "🔇 muted",
            Decision::Shown => "👁 shown",
        };
        println!("   {} {} ({:.3})", icon, decision.post_id, decision.best_similarity);
    }
    let muted = decisions.iter().filter(|d| d.decision == Decision::Muted).count();
    println!(
        "\n✅ {} muted, {} shown, {} without identity in {:.2?}",
        muted,
        decisions.len() - muted,
        skipped,
        started.elapsed()
    );
    Ok(())
}

/// Recursively walk `dir`, returning a Vec of image file paths.
fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    if dir.is_file() {
        return Ok(vec![dir.to_path_buf()]);
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let allowed_exts = ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"];
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if path.is_file() {
            if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
                if allowed_exts.contains(&ext.to_lowercase().as_str()) {
                    images.push(path.to_path_buf());
                }
            }
        }
        spinner.tick();
    }
    spinner.finish_with_message("Scan complete");
    Ok(images)
}

/// Hash every image under `dir` in parallel, skipping unreadable files.
fn hash_directory(dir: &Path) -> Result<Vec<(PathBuf, Fingerprint)>> {
    let images = scan_directory(dir)?;
    println!("▶ Parallel hashing {} images…", images.len());

    let hasher = PerceptualHasher::new();
    Ok(benchmark("hashing all images", || {
        images
            .par_iter()
            .filter_map(|path| match hasher.hash_path(path) {
                Ok(fp) => Some((path.clone(), fp)),
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    None
                }
            })
            .collect()
    }))
}

/// Images under `dir` scoring at least `threshold` against `target`, best first.
fn find_matching(dir: &Path, target: &Fingerprint, threshold: f64) -> Result<Vec<(PathBuf, f64)>> {
    let mut matches: Vec<(PathBuf, f64)> = hash_directory(dir)?
        .into_iter()
        .map(|(path, fp)| (path, similarity(Some(&fp), Some(target))))
        .filter(|(_, score)| *score >= threshold)
        .collect();
    matches.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(matches)
}

/// Every pair of images under `dir` scoring at least `threshold`, best first.
fn find_similar(dir: &Path, threshold: f64) -> Result<Vec<(PathBuf, PathBuf, f64)>> {
    let hashed = hash_directory(dir)?;

    if let [(path, fp)] = hashed.as_slice() {
        println!("   {}  {}", fp.to_base64(), path.display());
    }

    let mut matches: Vec<(PathBuf, PathBuf, f64)> = (0..hashed.len())
        .into_par_iter()
        .flat_map_iter(|i| {
            let hashed = &hashed;
            (i + 1..hashed.len()).filter_map(move |j| {
                let score = similarity(Some(&hashed[i].1), Some(&hashed[j].1));
                (score >= threshold).then(|| (hashed[i].0.clone(), hashed[j].0.clone(), score))
            })
        })
        .collect();
    matches.sort_by(|a, b| b.2.total_cmp(&a.2));
    Ok(matches)
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
