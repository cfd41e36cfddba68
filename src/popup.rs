use crate::analytics::{tree_name, WardSummary};
use crate::types::{display_value, first_displayable};
use anyhow::{Context, Result};
use geojson::JsonObject;
use serde::Serialize;
use tera::Tera;

const SCHOOL_FIELDS: [(&str, &str); 12] = [
    ("School Name", "name"),
    ("Type", "type"),
    ("Operator", "operator"),
    ("Phone", "phone"),
    ("Email", "email"),
    ("Website", "website"),
    ("Religion", "religion"),
    ("Grades", "grades"),
    ("Opening Hours", "opening_hours"),
    ("Street", "addr:street"),
    ("Postcode", "addr:postcode"),
    ("District", "addr:district"),
];

const TEMPLATES: [(&str, &str); 4] = [
    ("popups/school.html", include_str!("../views/popups/school.html")),
    ("popups/tree.html", include_str!("../views/popups/tree.html")),
    ("popups/ward.html", include_str!("../views/popups/ward.html")),
    ("popups/elevation.html", include_str!("../views/popups/elevation.html")),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopupRow {
    pub label: String,
    pub value: String,
}

impl PopupRow {
    fn new(label: &str, value: String) -> Self {
        Self { label: label.to_string(), value }
    }
}

fn rows_from(pairs: Vec<(&str, Option<String>)>) -> Vec<PopupRow> {
    pairs.into_iter()
        .filter_map(|(label, value)| value.map(|v| PopupRow::new(label, v)))
        .collect()
}

pub fn school_rows(props: &JsonObject) -> Vec<PopupRow> {
    rows_from(
        SCHOOL_FIELDS.iter()
            .map(|(label, key)| (*label, props.get(*key).and_then(display_value)))
            .collect(),
    )
}

pub fn tree_rows(props: &JsonObject) -> Vec<PopupRow> {
    let field = |key: &str| props.get(key).and_then(display_value);
    rows_from(vec![
        ("Tree ID", first_displayable(props, &["OBJECTID", "KGISTreeID"])),
        ("Department", field("DepartmentCode")),
        ("Ward", first_displayable(props, &["WardNumber", "Ward_No"])),
        ("Village ID", field("KGISVillageID")),
        ("Height", field("height").map(|h| format!("{h} m"))),
        ("DBH", field("dbh").map(|d| format!("{d} cm"))),
    ])
}

pub fn ward_rows(summary: &WardSummary) -> Vec<PopupRow> {
    let density = if summary.schools > 0 {
        format!("{:.1}/km²", summary.school_density)
    } else {
        "0/km²".to_string()
    };
    rows_from(vec![
        ("Ward No.", summary.number.clone().filter(|n| !n.is_empty())),
        ("Ward ID", summary.code.clone()),
        ("Area", Some(format!("{:.2} km²", summary.area_km2))),
        ("Schools", Some(summary.schools.to_string())),
        ("School density", Some(density)),
        ("Trees", Some(summary.trees.to_string())),
        ("Avg elevation", Some(format_elevation(summary.mean_elevation))),
    ])
}

pub fn format_elevation(value: Option<f64>) -> String {
    match value {
        Some(z) if z.is_finite() => format!("{z:.1} m"),
        _ => "—".to_string(),
    }
}

/// Renders popup bodies; every interpolated value is HTML-escaped.
pub struct PopupRenderer {
    tera: Tera,
}

impl PopupRenderer {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(TEMPLATES.to_vec())
            .context("Failed to compile popup templates")?;
        Ok(Self { tera })
    }

    fn render_table(&self, template: &str, title: &str, rows: &[PopupRow]) -> Result<String> {
        let mut ctx = tera::Context::new();
        ctx.insert("title", title);
        ctx.insert("rows", rows);
        self.tera.render(template, &ctx)
            .with_context(|| format!("Failed to render {template}"))
    }

    pub fn school(&self, props: &JsonObject) -> Result<String> {
        let title = props.get("name").and_then(display_value).unwrap_or_else(|| "School".to_string());
        self.render_table("popups/school.html", &title, &school_rows(props))
    }

    pub fn tree(&self, props: &JsonObject) -> Result<String> {
        self.render_table("popups/tree.html", &tree_name(props), &tree_rows(props))
    }

    pub fn ward(&self, summary: &WardSummary) -> Result<String> {
        self.render_table("popups/ward.html", &summary.name, &ward_rows(summary))
    }

    pub fn elevation(&self, z: f64) -> Result<String> {
        let mut ctx = tera::Context::new();
        ctx.insert("elevation", &format!("{z:.1}"));
        self.tera.render("popups/elevation.html", &ctx)
            .context("Failed to render popups/elevation.html")
    }
}
