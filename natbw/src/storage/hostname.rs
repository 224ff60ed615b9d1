use crate::utils::format_utils::format_mac;
use crate::utils::network_utils::parse_mac_address;
use anyhow::Context;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Parse `--aliases`: comma separated "mac=name" pairs
pub fn parse_aliases(spec: &str) -> Result<HashMap<String, String>, anyhow::Error> {
    let mut out = HashMap::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (mac_str, name) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid alias '{}': expected mac=name", entry))?;
        let (mac, name) = alias_entry(mac_str, name)
            .with_context(|| format!("Invalid alias '{}'", entry))?;
        out.insert(mac, name);
    }
    Ok(out)
}

/// Load an alias file.
/// File format: one entry per line - "mac name", `#` starts a comment line
pub fn load_alias_file(path: &Path) -> Result<HashMap<String, String>, anyhow::Error> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read alias file {}", path.display()))?;
    parse_alias_file(&content).with_context(|| format!("Invalid alias file {}", path.display()))
}

fn parse_alias_file(content: &str) -> Result<HashMap<String, String>, anyhow::Error> {
    let mut out = HashMap::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (mac_str, name) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow::anyhow!("line {}: expected 'mac name'", n + 1))?;
        let (mac, name) =
            alias_entry(mac_str, name).with_context(|| format!("line {}", n + 1))?;
        out.insert(mac, name);
    }
    Ok(out)
}

/// Merge the alias file (if any) with command line aliases, the latter win
pub fn load_aliases(
    cli_spec: &str,
    file: Option<&Path>,
) -> Result<HashMap<String, String>, anyhow::Error> {
    let mut aliases = match file {
        Some(path) => load_alias_file(path)?,
        None => HashMap::new(),
    };
    aliases.extend(parse_aliases(cli_spec)?);
    Ok(aliases)
}

// Normalized to the lower case colon form used by the ARP table
fn alias_entry(mac_str: &str, name: &str) -> Result<(String, String), anyhow::Error> {
    let mac = parse_mac_address(mac_str)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow::anyhow!("empty name for {}", mac_str));
    }
    Ok((format_mac(&mac), name.to_string()))
}
