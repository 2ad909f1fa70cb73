use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse a ports file content into a deduplicated list of TCP ports (1..=65535).
///
/// Supported formats per line:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comma separated mix: `22, 80, 8000-8002`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            push_port_spec(item, &mut out, &mut seen).with_context(|| format!("line {line_no}"))?;
        }
    }

    Ok(out)
}

/// Resolve the ports attempted per address from `port_ranges` entries and an
/// explicit `common_ports` list. Ranges come first, then common ports, first
/// appearance wins. Both empty yields [`default_ports`].
pub fn resolve_ports<S: AsRef<str>>(port_ranges: &[S], common_ports: &[u16]) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for spec in port_ranges {
        for item in spec.as_ref().split(',').map(str::trim).filter(|i| !i.is_empty()) {
            push_port_spec(item, &mut out, &mut seen)?;
        }
    }
    for &p in common_ports {
        if p == 0 {
            bail!("port out of range: 0");
        }
        if seen.insert(p) {
            out.push(p);
        }
    }
    if out.is_empty() {
        return Ok(default_ports());
    }
    Ok(out)
}

/// Load a ports list from a file path. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

/// A conservative default list of commonly used TCP ports.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 389, 443, 445, 465, 587, 636, 993, 995, 1433,
        1521, 2049, 2375, 2379, 3000, 3306, 3389, 5000, 5432, 5672, 5900, 5985, 5986, 6379, 6443,
        7001, 8000, 8080, 8081, 8443, 8888, 9000, 9092, 9200, 9300, 11211, 15672, 27017,
    ];
    DEFAULT.to_vec()
}

fn push_port_spec(item: &str, out: &mut Vec<u16>, seen: &mut HashSet<u16>) -> Result<()> {
    if let Some((a, b)) = item.split_once('-') {
        let start = parse_port_str(a.trim())
            .with_context(|| format!("invalid start in range: {a}"))?;
        let end = parse_port_str(b.trim())
            .with_context(|| format!("invalid end in range: {b}"))?;
        if start > end {
            bail!("invalid range {start}-{end} (start > end)");
        }
        for p in start..=end {
            if seen.insert(p) {
                out.push(p);
            }
        }
        return Ok(());
    }
    let p = parse_port_str(item).with_context(|| format!("invalid port value: {item}"))?;
    if seen.insert(p) {
        out.push(p);
    }
    Ok(())
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
