use crate::error::IngestError;
use crate::storage::rate::RateCounter;
use natbw_common::ClientStat;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

/// Traffic direction of a counter record, seen from the client
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One packet filter rule counter.
///
/// Every rule matches a single client address on exactly one side, the other
/// side is the wildcard address.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterRecord {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub bytes: u64,
}

impl CounterRecord {
    /// Client address and direction this counter belongs to
    pub fn local_ip(&self) -> Result<(IpAddr, Direction), IngestError> {
        match (
            self.source.is_unspecified(),
            self.destination.is_unspecified(),
        ) {
            (false, true) => Ok((self.source, Direction::Outbound)),
            (true, false) => Ok((self.destination, Direction::Inbound)),
            _ => Err(IngestError::LocalIpAmbiguous {
                src: self.source.to_string(),
                dst: self.destination.to_string(),
            }),
        }
    }
}

/// Per IP client state
#[derive(Debug)]
pub struct Client {
    pub ip: String,
    pub hw_address: String,
    pub name: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    inbound: RateCounter,
    outbound: RateCounter,
}

impl Client {
    pub fn new(ip: String, window: usize) -> Self {
        let now = SystemTime::now();
        Self {
            ip,
            hw_address: String::new(),
            name: String::new(),
            created_at: now,
            updated_at: now,
            inbound: RateCounter::new(window),
            outbound: RateCounter::new(window),
        }
    }

    fn update_counter(&mut self, direction: Direction, bytes: u64, timestamp: Instant) {
        let counter = match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        counter.update(bytes, timestamp);
        self.updated_at = SystemTime::now();
    }

    fn stat(&self, aliases: &HashMap<String, String>) -> ClientStat {
        let name = match aliases.get(&self.hw_address.to_lowercase()) {
            Some(alias) if !alias.is_empty() => alias.clone(),
            _ => self.name.clone(),
        };

        ClientStat {
            ip: self.ip.clone(),
            name,
            hwaddr: self.hw_address.clone(),
            in_rate: self.inbound.avg(),
            out_rate: self.outbound.avg(),
            manufacturer: String::new(),
        }
    }
}

/// All clients seen by any feed, behind one lock.
///
/// Clients are never evicted.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Client>>,
    aliases: HashMap<String, String>,
    window: usize,
}

impl ClientRegistry {
    /// `aliases` maps lower case hardware addresses to display names
    pub fn new(window: usize, aliases: HashMap<String, String>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            aliases,
            window,
        }
    }

    /// Record a single counter sample, creating the client when unseen
    pub fn ingest_counter_sample(
        &self,
        record: &CounterRecord,
        timestamp: Instant,
    ) -> Result<(), IngestError> {
        let (ip, direction) = record.local_ip()?;
        let mut clients = self.clients.lock().unwrap();
        Self::client_entry(&mut clients, ip.to_string(), self.window).update_counter(
            direction,
            record.bytes,
            timestamp,
        );
        Ok(())
    }

    /// Record one counter poll, all records share the poll timestamp.
    ///
    /// Stops at the first ambiguous record; records before it stay applied.
    pub fn ingest_counters(
        &self,
        records: &[CounterRecord],
        timestamp: Instant,
    ) -> Result<(), IngestError> {
        let mut clients = self.clients.lock().unwrap();
        for record in records {
            let (ip, direction) = record.local_ip()?;
            Self::client_entry(&mut clients, ip.to_string(), self.window).update_counter(
                direction,
                record.bytes,
                timestamp,
            );
        }
        Ok(())
    }

    /// Set the hardware address of a client, creating it when unseen
    pub fn ingest_identity(&self, ip: &str, hw_address: &str) {
        let mut clients = self.clients.lock().unwrap();
        let client = Self::client_entry(&mut clients, ip.to_string(), self.window);
        client.hw_address = hw_address.to_string();
        client.updated_at = SystemTime::now();
    }

    /// Batch form of `ingest_identity` for a whole ARP table read
    pub fn ingest_arp<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut clients = self.clients.lock().unwrap();
        let mut count = 0;
        for (ip, hw_address) in entries {
            let client = Self::client_entry(&mut clients, ip, self.window);
            client.hw_address = hw_address;
            client.updated_at = SystemTime::now();
            count += 1;
        }
        count
    }

    /// Set the display name of a known client. Unknown IPs are ignored.
    pub fn ingest_name(&self, ip: &str, name: &str) -> bool {
        let mut clients = self.clients.lock().unwrap();
        match clients.get_mut(ip) {
            Some(client) => {
                client.name = name.to_string();
                client.updated_at = SystemTime::now();
                true
            }
            None => {
                log::debug!("No client registered for {} ({})", ip, name);
                false
            }
        }
    }

    /// Batch form of `ingest_name`, returns how many clients were updated
    pub fn ingest_names(&self, names: &HashMap<String, String>) -> usize {
        names
            .iter()
            .filter(|(ip, name)| self.ingest_name(ip, name))
            .count()
    }

    /// Current stats of every client, rates evaluated now.
    ///
    /// `manufacturer` is left empty for the caller to resolve.
    pub fn snapshot(&self) -> Vec<ClientStat> {
        let clients = self.clients.lock().unwrap();
        clients
            .values()
            .map(|client| client.stat(&self.aliases))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    fn client_entry(
        clients: &mut HashMap<String, Client>,
        ip: String,
        window: usize,
    ) -> &mut Client {
        clients.entry(ip).or_insert_with_key(|ip| {
            log::debug!("New client {}", ip);
            Client::new(ip.clone(), window)
        })
    }
}
