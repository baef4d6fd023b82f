use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use glam::Vec3;
use ocme_author::EditSession;
use ocme_common::{CellKey, TriMesh};
use ocme_kernel::{Ocme, OcmeConfig};
use ocme_persist::DirStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ocme-cli", about = "CLI tool for out-of-core mesh stores")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON file with store settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the side factor of the configuration
    #[arg(long, global = true)]
    side_factor: Option<f32>,

    /// Override the cache budget, in bytes
    #[arg(long, global = true)]
    cache_budget: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty store in a directory
    Create { store: PathBuf },
    /// Add a synthetic grid mesh to a store
    Ingest(IngestArgs),
    /// Print store counters
    Stats { store: PathBuf },
    /// Check file integrity and structural invariants
    Verify { store: PathBuf },
    /// Recompute every impostor and rebuild the hierarchy
    BuildLod { store: PathBuf },
    /// Lift every editable vertex of a cell and commit
    EditDemo(EditDemoArgs),
}

#[derive(Args)]
struct IngestArgs {
    store: PathBuf,
    /// Grid corner as x,y,z
    #[arg(long, default_value = "0,0,0", value_parser = parse_vec3)]
    origin: Vec3,
    #[arg(long, default_value = "16")]
    nx: usize,
    #[arg(long, default_value = "16")]
    ny: usize,
    /// Spacing between grid vertices
    #[arg(long, default_value = "0.05")]
    step: f32,
    /// Colour vertices by position
    #[arg(long)]
    colored: bool,
}

#[derive(Args)]
struct EditDemoArgs {
    store: PathBuf,
    /// Cell to edit as x,y,z,h; defaults to the first cell holding faces
    #[arg(long, value_parser = parse_cell_key)]
    cell: Option<CellKey>,
    /// Vertical offset applied to each editable vertex
    #[arg(long, default_value = "0.01")]
    lift: f32,
    /// Undo the lift before committing
    #[arg(long)]
    undo: bool,
}

fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    match parts[..] {
        [x, y, z] => Ok(Vec3::new(x, y, z)),
        _ => Err(format!("expected x,y,z, got {s:?}")),
    }
}

fn parse_cell_key(s: &str) -> Result<CellKey, String> {
    let parts: Vec<i32> = s
        .split([',', '.'])
        .map(|p| p.trim().parse::<i32>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    match parts[..] {
        [x, y, z, h] => Ok(CellKey::new(x, y, z, h)),
        _ => Err(format!("expected x,y,z,h, got {s:?}")),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<OcmeConfig> {
    let mut config = match &cli.config {
        Some(path) => OcmeConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => OcmeConfig::default(),
    };
    if let Some(f) = cli.side_factor {
        config.side_factor = f;
    }
    if let Some(b) = cli.cache_budget {
        config.cache_budget_bytes = b;
    }
    Ok(config)
}

fn create_store(path: &Path, config: OcmeConfig) -> anyhow::Result<()> {
    if DirStore::exists(path) {
        bail!("{} already holds a store", path.display());
    }
    let dir = DirStore::open(path).with_context(|| format!("creating {}", path.display()))?;
    let ocme = Ocme::create(Box::new(dir), config)?;
    ocme.close()?;
    Ok(())
}

fn open_store(path: &Path, config: OcmeConfig) -> anyhow::Result<Ocme> {
    if !DirStore::exists(path) {
        bail!("{} holds no store; run `create` first", path.display());
    }
    let store = DirStore::open(path).with_context(|| format!("opening {}", path.display()))?;
    if store.meta().value_count == 0 {
        bail!("{} holds no store; run `create` first", path.display());
    }
    Ok(Ocme::open(Box::new(store), config)?)
}

fn grid_colors(mesh: &TriMesh) -> Vec<[u8; 4]> {
    let bbox = mesh.bbox();
    let extent = (bbox.max - bbox.min).max(Vec3::splat(f32::EPSILON));
    mesh.positions
        .iter()
        .map(|p| {
            let t = (*p - bbox.min) / extent;
            [(t.x * 255.0) as u8, (t.y * 255.0) as u8, 160, 255]
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Create { store } => {
            create_store(store, config)?;
            println!("Created store at {}", store.display());
        }
        Commands::Ingest(args) => {
            let mut ocme = open_store(&args.store, config)?;
            let mut mesh = TriMesh::grid(args.origin, args.nx, args.ny, args.step);
            if args.colored {
                let colors = grid_colors(&mesh);
                mesh = mesh.with_colors(colors);
            }
            let changes = ocme.add_mesh(&mesh)?;
            println!(
                "Ingested {} faces: {} cells added, {} touched",
                mesh.face_count(),
                changes.added.len(),
                changes.touched.len()
            );
            ocme.close()?;
        }
        Commands::Stats { store } => {
            let mut ocme = open_store(store, config)?;
            let stats = ocme.stats()?;
            println!("cells:       {}", stats.cells);
            println!("faces:       {}", stats.faces);
            println!("vertices:    {} ({} ghosts)", stats.vertices, stats.externals);
            println!("borders:     {}", stats.border_entries);
            println!("dependences: {}", stats.dependence_entries);
            println!("impostors:   {} ({} roots)", stats.impostors, ocme.roots().len());
            println!("chains:      {} in {} chunks", stats.chains, stats.chunks);
            println!(
                "cache:       {} loads, {} evictions, peak {} of {} bytes",
                stats.cache.loads, stats.cache.evictions, stats.cache.peak_bytes, stats.cache.budget_bytes
            );
            ocme.close()?;
        }
        Commands::Verify { store } => {
            if !DirStore::exists(store) {
                bail!("{} holds no store", store.display());
            }
            DirStore::open(store)?
                .verify_integrity()
                .context("integrity check failed")?;
            let mut ocme = open_store(store, config)?;
            ocme.check_all()?;
            println!("Verify: OK ({} cells)", ocme.cell_count());
            ocme.close()?;
        }
        Commands::BuildLod { store } => {
            let mut ocme = open_store(store, config)?;
            let keys: Vec<CellKey> = ocme.cell_keys().copied().collect();
            ocme.clear_impostors(&keys);
            ocme.fill_samples(&keys)?;
            ocme.build_impostors_hierarchy(&keys)?;
            let roots = ocme.roots();
            println!("Rebuilt {} impostors, {} roots", ocme.impostor_keys().count(), roots.len());
            for (key, samples) in ocme.root_samples() {
                println!("  root {key}: {} samples", samples.len());
            }
            ocme.close()?;
        }
        Commands::EditDemo(args) => {
            let mut ocme = open_store(&args.store, config)?;
            let cell = match args.cell {
                Some(c) => c,
                None => ocme
                    .cell_keys()
                    .copied()
                    .find(|k| ocme.face_count(k) > 0)
                    .context("store holds no faces")?,
            };

            let mut session = EditSession::new();
            let mesh = session.begin(&mut ocme, &[cell])?;
            let editable: Vec<u32> = (0..mesh.vertex_count() as u32)
                .filter(|&v| !mesh.is_vertex_locked(v))
                .collect();
            println!(
                "Editing {cell}: {} vertices ({} editable), {} faces",
                mesh.vertex_count(),
                editable.len(),
                mesh.face_count()
            );
            for &v in &editable {
                session.translate_vertex(v, Vec3::new(0.0, 0.0, args.lift))?;
            }
            if args.undo {
                while session.undo()? {}
                println!("Undid every edit");
            }

            let report = session.commit(&mut ocme)?;
            println!(
                "Committed: {} vertices updated, {} moved; {} faces updated, {} moved; {} cells removed",
                report.vertices_updated,
                report.vertices_moved,
                report.faces_updated,
                report.faces_moved,
                report.cells_removed
            );
            ocme.check_all()?;
            ocme.close()?;
        }
    }

    Ok(())
}
