use crate::config::{DemEncoding, ElevationRasterConfig};
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tracing::info;

/// Anything that can answer "how high is the ground here" in metres.
pub trait ElevationSource: Send + Sync {
    fn elevation_at(&self, lng: f64, lat: f64) -> Option<f64>;
}

/// Mapbox Terrain-RGB: -10000 + ((R * 256² + G * 256 + B) * 0.1)
pub fn decode_terrain_rgb(r: u8, g: u8, b: u8) -> f64 {
    let value = (r as u32) * 65536 + (g as u32) * 256 + (b as u32);
    -10000.0 + (value as f64) * 0.1
}

/// A north-up elevation grid covering `[west, south, east, north]`.
#[derive(Debug, Clone)]
pub struct RasterDem {
    width: usize,
    height: usize,
    values: Vec<f32>,
    bounds: [f64; 4],
}

impl RasterDem {
    pub fn open(config: &ElevationRasterConfig) -> Result<Self> {
        info!(path = ?config.path, "loading elevation raster");
        let img = image::open(&config.path)
            .with_context(|| format!("Failed to open elevation raster: {:?}", config.path))?
            .to_rgb8();
        Self::from_image(&img, config)
    }

    pub fn from_image(img: &RgbImage, config: &ElevationRasterConfig) -> Result<Self> {
        let span = config.max_elevation - config.min_elevation;
        let values = img
            .pixels()
            .map(|px| {
                let [r, g, b] = px.0;
                let z = match config.encoding {
                    DemEncoding::TerrainRgb => decode_terrain_rgb(r, g, b),
                    DemEncoding::Grayscale => {
                        // Rec. 601 luma of the pixel, scaled into the configured range
                        let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
                        config.min_elevation + luma / 255.0 * span
                    }
                };
                z as f32
            })
            .collect();
        Self::from_grid(img.width() as usize, img.height() as usize, values, config.bounds)
    }

    /// Row-major values, first row is the northern edge.
    pub fn from_grid(width: usize, height: usize, values: Vec<f32>, bounds: [f64; 4]) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("Elevation raster is empty"));
        }
        if values.len() != width * height {
            return Err(anyhow!(
                "Elevation raster has {} values, expected {}x{}",
                values.len(),
                width,
                height
            ));
        }
        let [west, south, east, north] = bounds;
        if !(east > west && north > south) {
            return Err(anyhow!("Elevation raster bounds are degenerate: {:?}", bounds));
        }
        Ok(Self { width, height, values, bounds })
    }

    fn value(&self, col: usize, row: usize) -> f64 {
        self.values[row * self.width + col] as f64
    }
}

impl ElevationSource for RasterDem {
    fn elevation_at(&self, lng: f64, lat: f64) -> Option<f64> {
        let [west, south, east, north] = self.bounds;
        if !(west..=east).contains(&lng) || !(south..=north).contains(&lat) {
            return None;
        }

        // Pixel centres sit half a cell in from the edges.
        let fx = ((lng - west) / (east - west) * self.width as f64 - 0.5)
            .clamp(0.0, (self.width - 1) as f64);
        let fy = ((north - lat) / (north - south) * self.height as f64 - 0.5)
            .clamp(0.0, (self.height - 1) as f64);

        let x0 = fx.floor() as usize;
        let y0 = fy.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let tx = fx - x0 as f64;
        let ty = fy - y0 as f64;

        let top = self.value(x0, y0) * (1.0 - tx) + self.value(x1, y0) * tx;
        let bottom = self.value(x0, y1) * (1.0 - tx) + self.value(x1, y1) * tx;
        let z = top * (1.0 - ty) + bottom * ty;
        z.is_finite().then_some(z)
    }
}
