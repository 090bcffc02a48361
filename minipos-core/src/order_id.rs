//! Per-day order identifiers of the form `POS-MMDDYYYY-NNN`.
//!
//! The sequence restarts at 1 each local calendar day. An allocated id is
//! held as *pending* until it is confirmed (the order was saved) or released
//! (the order was abandoned). Pending ids that are neither confirmed nor
//! released expire after `reservation_timeout`; expiry is checked lazily on
//! the next allocation.
//!
//! Uniqueness is per terminal. Two terminals allocating on the same day can
//! produce the same id; the caller sees the other terminal's id only once it
//! shows up in the known set passed to [`OrderIdAllocator::allocate`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};

const PREFIX: &str = "POS";

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(delta) = chrono::Duration::from_std(by) {
            *now += delta;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A parsed order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderId {
    date_key: String,
    sequence: u32,
}

impl OrderId {
    pub fn new(date: NaiveDate, sequence: u32) -> Self {
        Self {
            date_key: date_key(date),
            sequence,
        }
    }

    /// Parses `POS-MMDDYYYY-NNN`. Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split('-');
        if parts.next()? != PREFIX {
            return None;
        }
        let date_key = parts.next()?;
        let sequence = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if date_key.len() != 8 || !date_key.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            date_key: date_key.to_string(),
            sequence: sequence.parse().ok()?,
        })
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// The `MMDDYYYY` portion.
    pub fn date_key(&self) -> &str {
        &self.date_key
    }

    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date_key, "%m%d%Y").ok()
    }

    /// `MM/DD/YYYY`, for receipts.
    pub fn display_date(&self) -> String {
        format!("{}/{}/{}", &self.date_key[0..2], &self.date_key[2..4], &self.date_key[4..8])
    }

    /// `#NNN`, for the kitchen screen.
    pub fn display_number(&self) -> String {
        format!("#{:03}", self.sequence)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{:03}", PREFIX, self.date_key, self.sequence)
    }
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%m%d%Y").to_string()
}

/// Trailing sequence of an order id, or `None` if it is not one.
pub fn sequence_of(id: &str) -> Option<u32> {
    OrderId::parse(id).map(|o| o.sequence)
}

/// `MM/DD/YYYY` of an order id.
pub fn date_of(id: &str) -> Option<String> {
    OrderId::parse(id).map(|o| o.display_date())
}

/// `#NNN` of an order id. Foreign ids are shown as-is.
pub fn display_number(id: &str) -> String {
    OrderId::parse(id).map_or_else(|| id.to_string(), |o| o.display_number())
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// How long an allocated id stays reserved without confirm/release.
    pub reservation_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            reservation_timeout: Duration::from_secs(10),
        }
    }
}

/// Allocates `POS-MMDDYYYY-NNN` identifiers for one terminal.
pub struct OrderIdAllocator<C: Clock = SystemClock> {
    clock: C,
    config: AllocatorConfig,
    date_key: String,
    counter: u32,
    confirmed_high: u32,
    /// id -> expiry
    pending: HashMap<String, NaiveDateTime>,
    confirmed: HashSet<String>,
}

impl OrderIdAllocator<SystemClock> {
    pub fn new(config: AllocatorConfig) -> Self {
        Self::with_clock(SystemClock, config)
    }
}

impl<C: Clock> OrderIdAllocator<C> {
    pub fn with_clock(clock: C, config: AllocatorConfig) -> Self {
        let today = date_key(clock.now().date());
        Self {
            clock,
            config,
            date_key: today,
            counter: 0,
            confirmed_high: 0,
            pending: HashMap::new(),
            confirmed: HashSet::new(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Allocates the next id for today. `known` is every id already in use
    /// locally (order history plus ids held by tables); ids from other days
    /// or in other formats are ignored.
    pub fn allocate<'a, I>(&mut self, known: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = self.clock.now();
        self.roll_day(now.date());
        self.expire(now);

        let mut seen = HashSet::new();
        for raw in known {
            if let Some(id) = OrderId::parse(raw) {
                if id.date_key == self.date_key {
                    seen.insert(id.sequence);
                }
            }
        }
        let max_seen = seen.iter().copied().max().unwrap_or(0);

        let mut sequence = match max_seen.max(self.counter).checked_add(1) {
            Some(next) => next,
            None => {
                log::warn!("Order sequence for {} is exhausted, reusing the lowest free number", self.date_key);
                1
            }
        };
        loop {
            let candidate = OrderId {
                date_key: self.date_key.clone(),
                sequence,
            }
            .to_string();
            if seen.contains(&sequence)
                || self.pending.contains_key(&candidate)
                || self.confirmed.contains(&candidate)
            {
                log::debug!("Order id {} already taken, probing next", candidate);
                sequence = sequence.checked_add(1).unwrap_or(1);
                continue;
            }

            let expiry = now + self.timeout();
            self.pending.insert(candidate.clone(), expiry);
            self.counter = sequence;
            log::debug!("Allocated order id {}", candidate);
            return candidate;
        }
    }

    /// Marks a pending id as used. Returns `false` if it was not pending.
    pub fn confirm(&mut self, id: &str) -> bool {
        if self.pending.remove(id).is_none() {
            return false;
        }
        if let Some(parsed) = OrderId::parse(id) {
            if parsed.date_key == self.date_key {
                self.confirmed_high = self.confirmed_high.max(parsed.sequence);
            }
        }
        self.confirmed.insert(id.to_string());
        true
    }

    /// Gives a pending id back. If it was the most recent allocation the
    /// counter rolls back so the sequence can be reused.
    pub fn release(&mut self, id: &str) -> bool {
        if self.pending.remove(id).is_none() {
            return false;
        }
        log::debug!("Released order id {}", id);
        self.rewind();
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// The next sequence number that would be tried for today.
    pub fn peek_sequence(&self) -> u32 {
        self.counter.saturating_add(1)
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.reservation_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(10))
    }

    fn roll_day(&mut self, today: NaiveDate) {
        let key = date_key(today);
        if key != self.date_key {
            log::info!("Order sequence reset for new day {}", key);
            self.date_key = key;
            self.counter = 0;
            self.confirmed_high = 0;
            self.pending.clear();
            self.confirmed.clear();
        }
    }

    fn expire(&mut self, now: NaiveDateTime) {
        let before = self.pending.len();
        self.pending.retain(|_, expiry| *expiry > now);
        let expired = before - self.pending.len();
        if expired > 0 {
            log::debug!("Expired {} pending order id(s)", expired);
            self.rewind();
        }
    }

    fn rewind(&mut self) {
        let pending_high = self
            .pending
            .keys()
            .filter_map(|id| OrderId::parse(id))
            .filter(|id| id.date_key == self.date_key)
            .map(|id| id.sequence)
            .max()
            .unwrap_or(0);
        self.counter = self.confirmed_high.max(pending_high);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn allocator() -> OrderIdAllocator<ManualClock> {
        OrderIdAllocator::with_clock(ManualClock::new(at(2025, 1, 15, 9)), AllocatorConfig::default())
    }

    #[test]
    fn test_parse_and_format() {
        let id = OrderId::parse("POS-01152025-007").unwrap();
        assert_eq!(id.sequence(), 7);
        assert_eq!(id.display_date(), "01/15/2025");
        assert_eq!(id.display_number(), "#007");
        assert_eq!(id.to_string(), "POS-01152025-007");
        assert_eq!(id.date(), NaiveDate::from_ymd_opt(2025, 1, 15));
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(OrderId::parse("ORD-01152025-007").is_none());
        assert!(OrderId::parse("POS-0115-007").is_none());
        assert!(OrderId::parse("POS-01152025-abc").is_none());
        assert!(OrderId::parse("POS-01152025-007-x").is_none());
        assert!(OrderId::parse("1736930000000").is_none());
        assert_eq!(sequence_of("POS-01152025-012"), Some(12));
        assert_eq!(date_of("POS-01152025-012").as_deref(), Some("01/15/2025"));
        assert_eq!(display_number("legacy-42"), "legacy-42");
    }

    #[test]
    fn test_sequence_above_three_digits() {
        let id = OrderId::new(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(), 1000);
        assert_eq!(id.to_string(), "POS-01152025-1000");
        assert_eq!(OrderId::parse("POS-01152025-1000").unwrap().sequence(), 1000);
    }

    #[test]
    fn test_consecutive_confirmed_allocations() {
        let mut alloc = allocator();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = alloc.allocate(std::iter::empty());
            assert!(alloc.confirm(&id));
            ids.push(id);
        }
        assert_eq!(
            ids,
            vec![
                "POS-01152025-001",
                "POS-01152025-002",
                "POS-01152025-003",
                "POS-01152025-004",
                "POS-01152025-005",
            ]
        );
    }

    #[test]
    fn test_known_id_at_sequence_ceiling() {
        let mut alloc = allocator();
        let known = ["POS-01152025-4294967295", "POS-01152025-001"];
        let first = alloc.allocate(known.iter().copied());
        assert_eq!(first, "POS-01152025-002");
        let second = alloc.allocate(known.iter().copied());
        assert_eq!(second, "POS-01152025-003");
        assert!(alloc.peek_sequence() > 0);
    }

    #[test]
    fn test_known_ids_skip_ahead() {
        let mut alloc = allocator();
        let known = ["POS-01152025-004", "POS-01142025-020", "legacy-id"];
        let id = alloc.allocate(known.iter().copied());
        assert_eq!(id, "POS-01152025-005");
    }

    #[test]
    fn test_release_rolls_back_tail() {
        let mut alloc = allocator();
        let first = alloc.allocate(std::iter::empty());
        alloc.confirm(&first);
        let second = alloc.allocate(std::iter::empty());
        assert_eq!(second, "POS-01152025-002");

        assert!(alloc.release(&second));
        assert!(!alloc.release(&second));
        assert_eq!(alloc.allocate(std::iter::empty()), "POS-01152025-002");
    }

    #[test]
    fn test_release_of_earlier_id_keeps_counter() {
        let mut alloc = allocator();
        let a = alloc.allocate(std::iter::empty());
        let b = alloc.allocate(std::iter::empty());
        assert_eq!(b, "POS-01152025-002");
        alloc.release(&a);
        assert_eq!(alloc.allocate(std::iter::empty()), "POS-01152025-003");
    }

    #[test]
    fn test_pending_expires() {
        let mut alloc = allocator();
        let id = alloc.allocate(std::iter::empty());
        assert!(alloc.is_pending(&id));

        alloc.clock().advance(Duration::from_secs(11));
        let next = alloc.allocate(std::iter::empty());
        assert_eq!(next, "POS-01152025-001");
        assert!(!alloc.confirm("POS-01152025-999"));
    }

    #[test]
    fn test_day_rollover_restarts_sequence() {
        let mut alloc = allocator();
        for _ in 0..3 {
            let id = alloc.allocate(std::iter::empty());
            alloc.confirm(&id);
        }
        alloc.clock().set(at(2025, 1, 16, 0));
        assert_eq!(alloc.allocate(std::iter::empty()), "POS-01162025-001");
    }

    #[test]
    fn test_confirmed_ids_never_reissued() {
        let mut alloc = allocator();
        let a = alloc.allocate(std::iter::empty());
        alloc.confirm(&a);
        let b = alloc.allocate(std::iter::empty());
        alloc.release(&b);
        let c = alloc.allocate(std::iter::empty());
        assert_ne!(a, c);
    }
}
