use crate::error::OuiError;
use crate::utils::network_utils::{is_locally_administered, is_multicast_mac, parse_mac_address};
use std::fs;
use std::path::Path;

/// Organization names are stored as fixed 8 character display strings
const ORGANIZATION_LEN: usize = 8;

/// Registry housekeeping entries that are not real vendors
const RESERVED_ORGANIZATIONS: [&str; 2] = ["IeeeRegi", "Spanning"];

/// Shared view over the two address block widths
pub trait AddressBlock {
    fn prefix(&self) -> u64;
    fn mask(&self) -> u64;
    fn organization(&self) -> &str;
}

/// Block with a prefix length of at most 24 bits (an OUI)
#[derive(Debug, Clone)]
pub struct AddressBlock24 {
    oui: [u8; 3],
    organization: String,
}

impl AddressBlock for AddressBlock24 {
    fn prefix(&self) -> u64 {
        (self.oui[0] as u64) << 40 | (self.oui[1] as u64) << 32 | (self.oui[2] as u64) << 24
    }

    fn mask(&self) -> u64 {
        prefix_mask(24)
    }

    fn organization(&self) -> &str {
        &self.organization
    }
}

/// Block with a prefix length between 25 and 48 bits (MA-M, MA-S, IAB)
#[derive(Debug, Clone)]
pub struct AddressBlock48 {
    address: [u8; 6],
    prefix_len: u8,
    organization: String,
}

impl AddressBlock for AddressBlock48 {
    // Entries may list a full address, only the covered bits take part
    fn prefix(&self) -> u64 {
        mac_to_u64(&self.address) & self.mask()
    }

    fn mask(&self) -> u64 {
        prefix_mask(self.prefix_len)
    }

    fn organization(&self) -> &str {
        &self.organization
    }
}

/// Convert a MAC address to the low 48 bits of a u64
pub fn mac_to_u64(mac: &[u8; 6]) -> u64 {
    mac.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// Mask selecting the top `prefix_len` bits of a 48 bit address
pub fn prefix_mask(prefix_len: u8) -> u64 {
    let prefix_len = prefix_len.min(48) as u32;
    !((1u64 << (48 - prefix_len)) - 1)
}

/// Binary search over blocks sorted by prefix.
///
/// The query is masked with the candidate's own mask before comparing, so the
/// first block hit wins when masked prefixes collide.
fn search<B: AddressBlock>(blocks: &[B], addr: u64) -> Option<&B> {
    if blocks.is_empty() {
        return None;
    }

    let (mut lo, mut hi) = (0usize, blocks.len() - 1);
    loop {
        let k = (lo + hi) / 2;
        let block = &blocks[k];
        let masked = addr & block.mask();

        if masked == block.prefix() {
            return Some(block);
        }
        if lo == hi {
            return None;
        }
        if masked < block.prefix() {
            hi = k;
        } else {
            lo = k + 1;
        }
    }
}

/// Hardware address vendor database
#[derive(Debug, Default)]
pub struct VendorDb {
    blocks24: Vec<AddressBlock24>,
    blocks48: Vec<AddressBlock48>,
}

impl VendorDb {
    /// Parse a vendor database (Wireshark `manuf` layout).
    ///
    /// Lines that cannot be parsed are skipped; the load only fails when no
    /// block at all was found.
    pub fn load(text: &str) -> Result<Self, OuiError> {
        let mut db = VendorDb::default();
        let mut skipped = 0usize;

        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') || line.starts_with('\t') {
                continue;
            }

            // Token ring entries
            if line.contains("[TR?]") {
                continue;
            }

            let Some((addr, organization)) = split_line(line) else {
                skipped += 1;
                continue;
            };

            if RESERVED_ORGANIZATIONS
                .iter()
                .any(|reserved| organization.starts_with(*reserved))
            {
                continue;
            }

            let (address, prefix_len) = match parse_block_address(addr) {
                Some(parsed) => parsed,
                None => {
                    log::debug!("Skipping vendor database line: {}", line);
                    skipped += 1;
                    continue;
                }
            };

            if prefix_len > 24 {
                db.blocks48.push(AddressBlock48 {
                    address,
                    prefix_len,
                    organization,
                });
            } else {
                db.blocks24.push(AddressBlock24 {
                    oui: [address[0], address[1], address[2]],
                    organization,
                });
            }
        }

        if db.blocks24.is_empty() && db.blocks48.is_empty() {
            return Err(OuiError::Empty);
        }

        // Stable sorts keep database order among equal prefixes
        db.blocks24.sort_by_key(|b| b.prefix());
        db.blocks48.sort_by_key(|b| b.prefix());

        if skipped > 0 {
            log::debug!("Skipped {} malformed vendor database lines", skipped);
        }

        Ok(db)
    }

    /// Read and parse a vendor database file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, OuiError> {
        let text = fs::read_to_string(path)?;
        Self::load(&text)
    }

    /// Look up the organization owning a hardware address.
    ///
    /// Returns `Ok(None)` when no block covers the address.
    pub fn lookup(&self, hw_address: &str) -> Result<Option<String>, OuiError> {
        let mac = parse_mac_address(hw_address)
            .map_err(|_| OuiError::InvalidAddress(hw_address.to_string()))?;
        let addr = mac_to_u64(&mac);

        if let Some(block) = search(&self.blocks48, addr) {
            return Ok(Some(block.organization().to_string()));
        }

        Ok(search(&self.blocks24, addr).map(|b| b.organization().to_string()))
    }

    /// Manufacturer column for the stats API.
    ///
    /// Falls back to `{multicast}` or `{local/random}` when the vendor is
    /// unknown and the address carries the corresponding flag bits.
    pub fn manufacturer(&self, hw_address: &str) -> Result<String, OuiError> {
        if let Some(org) = self.lookup(hw_address)? {
            return Ok(org);
        }
        Ok(manufacturer_fallback(hw_address))
    }

    pub fn len24(&self) -> usize {
        self.blocks24.len()
    }

    pub fn len48(&self) -> usize {
        self.blocks48.len()
    }
}

/// Flag based display string for addresses without a vendor
pub fn manufacturer_fallback(hw_address: &str) -> String {
    match parse_mac_address(hw_address) {
        Ok(mac) if is_multicast_mac(&mac) => "{multicast}".to_string(),
        Ok(mac) if is_locally_administered(&mac) => "{local/random}".to_string(),
        _ => String::new(),
    }
}

// Split "ADDRESS\tORGANIZATION[\tLONG NAME][ # comment]"
fn split_line(line: &str) -> Option<(&str, String)> {
    let (addr, rest) = line.split_once('\t')?;
    let addr = addr.trim();
    if addr.is_empty() || addr.contains(char::is_whitespace) {
        return None;
    }

    let field = rest.trim_start_matches('\t');
    let field = field.split('\t').next().unwrap_or("");
    let field = match field.find(" #") {
        Some(pos) => &field[..pos],
        None => field,
    };
    let field = field.trim();
    if field.is_empty() {
        return None;
    }

    let organization: String = field.chars().take(ORGANIZATION_LEN).collect();
    Some((addr, organization.trim().to_string()))
}

// "00:11:22" (length inferred from the number of groups) or "00:11:22:33:40:00/36"
fn parse_block_address(addr: &str) -> Option<([u8; 6], u8)> {
    let (mac, prefix_len) = match addr.split_once('/') {
        Some((mac, len)) => (mac, len.parse::<u8>().ok()?),
        None => (addr, ((addr.len() + 1) / 3 * 8) as u8),
    };

    if prefix_len == 0 || prefix_len > 48 {
        return None;
    }

    Some((parse_partial_mac(mac)?, prefix_len))
}

// Up to six hex groups, missing trailing octets are zero
fn parse_partial_mac(s: &str) -> Option<[u8; 6]> {
    let sep = if s.contains(':') { ':' } else { '-' };
    let mut mac = [0u8; 6];
    let mut count = 0;
    for (i, part) in s.split(sep).enumerate() {
        if i >= 6 {
            return None;
        }
        mac[i] = u8::from_str_radix(part, 16).ok()?;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(mac)
}
