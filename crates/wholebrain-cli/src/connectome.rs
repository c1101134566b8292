//! Connectome files: JSON array of rows, or a text matrix with one row per
//! line and entries separated by commas or whitespace (`#` starts a comment).

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;
use wholebrain_core::Connectome;

pub fn load(path: &Path) -> Result<Connectome> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading connectome {}", path.display()))?;
    let is_json = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    let rows = if is_json {
        serde_json::from_str::<Vec<Vec<f64>>>(&text)
            .with_context(|| format!("parsing JSON matrix {}", path.display()))?
    } else {
        parse_text(&text).with_context(|| format!("parsing matrix {}", path.display()))?
    };

    let connectome = Connectome::from_rows(&rows)?;
    info!(
        path = %path.display(),
        regions = connectome.n_regions(),
        id = %connectome.id(),
        "loaded connectome"
    );
    Ok(match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => connectome.with_label(stem),
        None => connectome,
    })
}

fn parse_text(text: &str) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|field| !field.is_empty())
            .map(|field| {
                field
                    .parse::<f64>()
                    .with_context(|| format!("line {}: bad number {:?}", number + 1, field))
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    if rows.is_empty() {
        bail!("no matrix rows found");
    }
    Ok(rows)
}
