use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub map: MapConfig,
    pub input: InputConfig,
    #[serde(default)]
    pub dem: DemConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
    #[serde(default = "default_views_dir")]
    pub views_dir: PathBuf,
    // Normally supplied through MAPBOX_TOKEN rather than the file.
    #[serde(default)]
    pub mapbox_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapConfig {
    #[serde(default = "default_style")]
    pub style: String,
    pub center: [f64; 2],
    #[serde(default = "default_zoom")]
    pub zoom: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub datasets: Vec<DatasetConfig>,
    pub schools: Option<String>, // URL path under public_dir
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Trees,
    Wards,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    pub id: String,
    pub url: String,
    pub color: String, // Hex code
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: DatasetKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DemConfig {
    /// Image draped over the map as a raster overlay.
    pub overlay: Option<String>,
    /// `[west, south, east, north]` of the overlay image.
    #[serde(default = "default_dem_bounds")]
    pub overlay_bounds: [f64; 4],
    pub elevation: Option<ElevationRasterConfig>,
    #[serde(default = "default_terrain_source")]
    pub terrain_source: String,
    #[serde(default = "default_exaggeration")]
    pub exaggeration: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElevationRasterConfig {
    pub path: PathBuf,
    /// `[west, south, east, north]` covered by the raster.
    pub bounds: [f64; 4],
    #[serde(default)]
    pub encoding: DemEncoding,
    #[serde(default)]
    pub min_elevation: f64,
    #[serde(default = "default_max_elevation")]
    pub max_elevation: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DemEncoding {
    #[default]
    TerrainRgb,
    Grayscale,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_yield_every")]
    pub yield_every: usize,
    #[serde(default = "default_cluster_radius")]
    pub cluster_radius: f64,
    #[serde(default = "default_cluster_max_zoom")]
    pub cluster_max_zoom: u8,
}

impl Default for DemConfig {
    fn default() -> Self {
        Self {
            overlay: None,
            overlay_bounds: default_dem_bounds(),
            elevation: None,
            terrain_source: default_terrain_source(),
            exaggeration: default_exaggeration(),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            yield_every: default_yield_every(),
            cluster_radius: default_cluster_radius(),
            cluster_max_zoom: default_cluster_max_zoom(),
        }
    }
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 3000 }
fn default_public_dir() -> PathBuf { PathBuf::from("public") }
fn default_views_dir() -> PathBuf { PathBuf::from("views") }
fn default_style() -> String { "mapbox://styles/mapbox/streets-v12".to_string() }
fn default_zoom() -> f64 { 10.0 }
fn default_dem_bounds() -> [f64; 4] { [77.4598611, 12.8334722, 77.7843056, 13.1426389] }
fn default_terrain_source() -> String { "mapbox://mapbox.mapbox-terrain-dem-v1".to_string() }
fn default_exaggeration() -> f64 { 1.4 }
fn default_max_elevation() -> f64 { 1000.0 }
fn default_batch_size() -> usize { 50 }
fn default_yield_every() -> usize { 10 }
fn default_cluster_radius() -> f64 { 50.0 }
fn default_cluster_max_zoom() -> u8 { 14 }

/// Deepest clustered zoom; cluster ids pack the zoom into five bits.
pub const MAX_CLUSTER_ZOOM: u8 = 24;

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.analytics.cluster_max_zoom > MAX_CLUSTER_ZOOM {
            bail!(
                "analytics.cluster_max_zoom must be at most {}, got {}",
                MAX_CLUSTER_ZOOM,
                self.analytics.cluster_max_zoom
            );
        }
        if self.analytics.batch_size == 0 || self.analytics.yield_every == 0 {
            bail!("analytics.batch_size and analytics.yield_every must be positive");
        }
        Ok(())
    }

    /// Applies `MAPBOX_TOKEN`, `HOST` and `PORT` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("MAPBOX_TOKEN") {
            self.server.mapbox_token = Some(token);
        }
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {:?}", port))?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.server.host, self.server.port))
    }

    /// Maps a public URL path such as `/data/ward/BBMP.geojson` onto the public directory.
    pub fn public_path(&self, url: &str) -> PathBuf {
        self.server.public_dir.join(url.trim_start_matches('/'))
    }

    pub fn ward_dataset(&self) -> Option<&DatasetConfig> {
        self.input.datasets.iter().find(|d| d.kind == DatasetKind::Wards)
    }
}

#[cfg(test)]
pub(crate) fn sample_config() -> AppConfig {
    AppConfig::from_toml(
        r##"
        [server]
        public_dir = "public"

        [map]
        center = [77.5946, 12.9716]

        [[input.datasets]]
        id = "layer1"
        url = "/data/trees/east.geojson"
        color = "#3b82f6"
        label = "East Zone Trees"
        kind = "trees"

        [[input.datasets]]
        id = "layer2"
        url = "/data/trees/south.geojson"
        color = "#27F5E4"
        label = "South Zone Trees"
        kind = "trees"

        [[input.datasets]]
        id = "bbmp"
        url = "/data/ward/BBMP.geojson"
        color = "#7c3aed"
        label = "BBMP Wards"
        kind = "wards"
        "##,
    )
    .expect("sample config parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_sections() {
        let config = sample_config();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.analytics.batch_size, 50);
        assert_eq!(config.analytics.cluster_max_zoom, 14);
        assert_eq!(config.dem.exaggeration, 1.4);
        assert!(config.input.schools.is_none());
        assert_eq!(config.ward_dataset().map(|d| d.id.as_str()), Some("bbmp"));
    }

    #[test]
    fn environment_overrides_token_and_binding() {
        let mut config = sample_config();
        config
            .apply_overrides(|key| match key {
                "MAPBOX_TOKEN" => Some("pk.test".to_string()),
                "PORT" => Some("8080".to_string()),
                "HOST" => Some("0.0.0.0".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.mapbox_token.as_deref(), Some("pk.test"));
        assert_eq!(config.bind_addr().unwrap().to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn rejects_malformed_port() {
        let mut config = sample_config();
        let result = config.apply_overrides(|key| (key == "PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml");
        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.input.datasets.len(), 4);
        assert_eq!(config.input.schools.as_deref(), Some("/data/school/Overpass_school.geojson"));
        let raster = config.dem.elevation.expect("elevation raster configured");
        assert_eq!(raster.encoding, DemEncoding::TerrainRgb);
    }

    fn with_analytics(section: &str) -> Result<AppConfig> {
        AppConfig::from_toml(&format!(
            "[server]\n[map]\ncenter = [77.59, 12.97]\n[input]\ndatasets = []\n[analytics]\n{section}\n"
        ))
    }

    #[test]
    fn cluster_zoom_beyond_id_range_is_rejected() {
        assert_eq!(with_analytics("cluster_max_zoom = 24").unwrap().analytics.cluster_max_zoom, 24);
        for zoom in [25, 31, 255] {
            let err = with_analytics(&format!("cluster_max_zoom = {zoom}")).unwrap_err();
            assert!(err.to_string().contains("cluster_max_zoom"), "{err}");
        }
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(with_analytics("batch_size = 0").is_err());
        assert!(with_analytics("yield_every = 0").is_err());
    }

    #[test]
    fn public_path_strips_leading_slash() {
        let config = sample_config();
        assert_eq!(
            config.public_path("/data/ward/BBMP.geojson"),
            PathBuf::from("public/data/ward/BBMP.geojson")
        );
    }
}
