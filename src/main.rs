use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use geo::Point;
use manzanas::config::AppConfig;
use manzanas::data::{FetchScope, Fetched, Fetcher, Filter};
use manzanas::remote::PostgrestStore;
use manzanas::selection::{SelectionStore, Statistics};
use manzanas::spatial::{self, SpatialIndex};
use manzanas::types::{BoundingBox, FeatureCollection};
use manzanas::{server, variables};
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ScopeArgs {
    /// Only blocks of this comuna
    #[arg(long, conflicts_with_all = ["gran_concepcion", "bounds"])]
    comuna: Option<String>,
    /// Only the Gran Concepción comunas
    #[arg(long, conflicts_with = "bounds")]
    gran_concepcion: bool,
    /// Only blocks in min_lng,min_lat,max_lng,max_lat
    #[arg(long, value_parser = parse_bounds)]
    bounds: Option<BoundingBox>,
}

impl ScopeArgs {
    fn filter(&self) -> Option<Filter> {
        if let Some(comuna) = &self.comuna {
            Some(Filter::Comuna(comuna.clone()))
        } else if self.gran_concepcion {
            Some(Filter::gran_concepcion())
        } else {
            self.bounds.map(Filter::Bounds)
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download census blocks and write them as GeoJSON
    Fetch {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[command(flatten)]
        scope: ScopeArgs,
        /// Overrides output.geojson from the config
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// List comunas, or print totals for one
    Comunas {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long, value_name = "COMUNA")]
        stats: Option<String>,
    },
    /// Summarize a GeoJSON file, whole or through a radius lens
    Summarize {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
        #[arg(long, default_value_t = 0.5)]
        radius_km: f64,
        /// Also classify the selection for this heatmap variable
        #[arg(long, value_name = "VARIABLE")]
        heatmap: Option<String>,
    },
    /// Serve the dashboard API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Serve this GeoJSON instead of fetching from the remote store
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn parse_bounds(value: &str) -> std::result::Result<BoundingBox, String> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid coordinate: {}", e))?;
    match parts.as_slice() {
        [min_lng, min_lat, max_lng, max_lat] => {
            Ok(BoundingBox::new(*min_lng, *min_lat, *max_lng, *max_lat))
        }
        _ => Err("expected min_lng,min_lat,max_lng,max_lat".to_string()),
    }
}

fn fetcher(config: &AppConfig) -> Result<Fetcher<PostgrestStore>> {
    let api_key = config.remote.resolve_api_key()?;
    let store = PostgrestStore::new(&config.remote, api_key)
        .context("Failed to initialise remote store client")?;
    Ok(Fetcher::with_page_size(store, config.remote.page_size))
}

async fn fetch_collection(config: &AppConfig, scope: &ScopeArgs) -> Result<Fetched> {
    let fetcher = fetcher(config)?;
    let fetched = match scope.filter() {
        None => Fetched {
            collection: fetcher.fetch_all().await?,
            scope: FetchScope::Filtered,
        },
        Some(filter) => fetcher.fetch_by_filter(&filter).await?,
    };
    if fetched.is_degraded() {
        warn!("Bounds filter unsupported by the store: result covers every manzana");
    }
    Ok(fetched)
}

fn read_collection(path: &Path) -> Result<FeatureCollection> {
    let file =
        File::open(path).with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse GeoJSON FeatureCollection: {:?}", path))
}

fn write_collection(path: &Path, collection: &FeatureCollection) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, collection)
        .with_context(|| format!("Failed to write GeoJSON to {:?}", path))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush GeoJSON to {:?}", path))
}

fn summarize(
    collection: FeatureCollection,
    lens: Option<(f64, f64, f64)>,
    heatmap: Option<&str>,
) -> Result<()> {
    let mut store = SelectionStore::new();
    let stats = Statistics::register(&mut store);

    let selected = match lens {
        Some((lat, lon, radius_km)) => {
            let index = SpatialIndex::build(&collection.features);
            let hits = index.within_radius(Point::new(lon, lat), radius_km);
            spatial::select(&collection.features, &hits)
        }
        None => collection.features,
    };
    info!("Selected {} manzanas", selected.len());
    store.set(selected);

    let mut report = json!({
        "manzanas": store.len(),
        "totalPopulation": stats.total_population.get(),
        "gender": stats.gender.get(),
        "ageGroups": stats.age_groups.get(),
        "employment": stats.employment.get(),
        "literacy": stats.literacy.get(),
        "housing": stats.housing.get(),
        "avgAge": stats.avg_age.get(),
        "households": stats.households.get(),
    });
    if let Some(id) = heatmap {
        let variable = variables::find_variable(id)
            .with_context(|| format!("Unknown heatmap variable: {}", id))?;
        let map = variables::heatmap(variable, store.features());
        report["heatmap"] = json!({ "variable": map.variable, "highlighted": map.highlighted });
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch { config, scope, output } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let Fetched { collection, .. } = fetch_collection(&app_config, &scope).await?;
            let output = output.unwrap_or_else(|| app_config.output.geojson.clone());
            write_collection(&output, &collection)?;
            info!("Wrote {} manzanas to {:?}", collection.len(), output);
        }
        Commands::Comunas { config, stats } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let fetcher = fetcher(&app_config)?;
            match stats {
                Some(comuna) => {
                    let stats = fetcher.comuna_stats(&comuna).await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                None => {
                    for comuna in fetcher.list_comunas().await? {
                        println!("{}", comuna);
                    }
                }
            }
        }
        Commands::Summarize {
            input,
            lat,
            lon,
            radius_km,
            heatmap,
        } => {
            let collection = read_collection(&input)?;
            let lens = lat.zip(lon).map(|(lat, lon)| (lat, lon, radius_km));
            summarize(collection, lens, heatmap.as_deref())?;
        }
        Commands::Serve {
            config,
            input,
            scope,
        } => {
            let app_config = AppConfig::load_from_file(&config)?;
            let fetched = match &input {
                Some(path) => Fetched {
                    collection: read_collection(path)?,
                    scope: FetchScope::Filtered,
                },
                None => fetch_collection(&app_config, &scope).await?,
            };
            server::start_server(app_config, fetched).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bounds() {
        let bounds = parse_bounds("-73.2,-37.0,-72.9,-36.7").unwrap();
        assert_eq!(bounds, BoundingBox::new(-73.2, -37.0, -72.9, -36.7));
        assert!(parse_bounds("1,2,3").is_err());
        assert!(parse_bounds("a,b,c,d").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn geojson_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.geojson");
        let collection = FeatureCollection::new(vec![manzanas::types::Feature::new(
            json!({"type": "Point", "coordinates": [-73.0, -36.8]}),
            json!({"n_per": 4}).as_object().cloned().unwrap_or_default(),
        )]);
        write_collection(&path, &collection).unwrap();
        assert_eq!(read_collection(&path).unwrap(), collection);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_final_flush_is_an_error() {
        let collection = FeatureCollection::new(vec![manzanas::types::Feature::new(
            json!({"type": "Point", "coordinates": [-73.0, -36.8]}),
            Default::default(),
        )]);
        let err = write_collection(Path::new("/dev/full"), &collection).unwrap_err();
        assert!(format!("{:#}", err).contains("/dev/full"));
    }
}
