//! # Network Simulation
//!
//! Deterministic in-process link model for testing the stack under loss,
//! jitter, duplication and reordering, without sockets or sleeps.
//!
//! ## Design
//!
//! - Virtual time: the caller owns the clock and passes `now` explicitly
//! - Deterministic LCG randomness, seeded per link
//! - Optional blackout (total loss) and per-direction drop filters for
//!   scripted failure scenarios

use std::time::{Duration, Instant};

use crate::session::Session;

/// Network conditions for simulation.
#[derive(Clone, Copy, Debug)]
pub struct NetworkConditions {
    /// Base one-way latency in milliseconds.
    pub base_latency_ms: u32,
    /// Jitter (variance) in milliseconds.
    pub jitter_ms: u32,
    /// Packet loss percentage (0-100).
    pub packet_loss_percent: u8,
    /// Duplicate packet percentage (0-100).
    pub duplicate_percent: u8,
    /// Out-of-order percentage (0-100).
    pub out_of_order_percent: u8,
}

impl NetworkConditions {
    /// Perfect network conditions (LAN).
    pub const PERFECT: Self = Self {
        base_latency_ms: 1,
        jitter_ms: 0,
        packet_loss_percent: 0,
        duplicate_percent: 0,
        out_of_order_percent: 0,
    };

    /// Good network conditions (fiber).
    pub const GOOD: Self = Self {
        base_latency_ms: 20,
        jitter_ms: 5,
        packet_loss_percent: 0,
        duplicate_percent: 0,
        out_of_order_percent: 0,
    };

    /// Average network conditions (cable).
    pub const AVERAGE: Self = Self {
        base_latency_ms: 50,
        jitter_ms: 20,
        packet_loss_percent: 1,
        duplicate_percent: 1,
        out_of_order_percent: 2,
    };

    /// Poor network conditions (mobile/wifi).
    pub const POOR: Self = Self {
        base_latency_ms: 100,
        jitter_ms: 50,
        packet_loss_percent: 5,
        duplicate_percent: 2,
        out_of_order_percent: 5,
    };
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self::PERFECT
    }
}

/// Simple linear congruential generator for deterministic randomness.
/// Same parameters as MINSTD; no external dependencies.
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(48271).wrapping_rem(2_147_483_647);
        self.state as u32
    }

    fn percent_roll(&mut self) -> u8 {
        (self.next() % 100) as u8
    }
}

/// Optional scripted drop decision for one direction.
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// One direction of the simulated link.
struct Pipe {
    in_flight: Vec<(Instant, Vec<u8>)>,
    filter: Option<DropFilter>,
}

impl Pipe {
    fn new() -> Self {
        Self {
            in_flight: Vec::new(),
            filter: None,
        }
    }
}

/// Link statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkStats {
    /// Datagrams handed to the link.
    pub transmitted: u64,
    /// Datagrams dropped by loss, blackout, or filters.
    pub dropped: u64,
    /// Datagrams delivered.
    pub delivered: u64,
    /// Datagrams duplicated.
    pub duplicated: u64,
}

/// Deterministic bidirectional lossy link between two endpoints.
pub struct SimulatedLink {
    conditions: NetworkConditions,
    rng: SimpleRng,
    a_to_b: Pipe,
    b_to_a: Pipe,
    blackout: bool,
    stats: LinkStats,
}

/// Direction selector on a [`SimulatedLink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// From endpoint A toward endpoint B.
    AtoB,
    /// From endpoint B toward endpoint A.
    BtoA,
}

impl SimulatedLink {
    /// Creates a link with the given conditions and RNG seed.
    #[must_use]
    pub fn new(conditions: NetworkConditions, seed: u64) -> Self {
        Self {
            conditions,
            rng: SimpleRng::new(seed),
            a_to_b: Pipe::new(),
            b_to_a: Pipe::new(),
            blackout: false,
            stats: LinkStats::default(),
        }
    }

    /// Replaces the link conditions.
    pub fn set_conditions(&mut self, conditions: NetworkConditions) {
        self.conditions = conditions;
    }

    /// Enables or disables total loss in both directions.
    pub fn set_blackout(&mut self, blackout: bool) {
        self.blackout = blackout;
    }

    /// Installs a scripted drop filter for one direction.
    ///
    /// The filter sees each raw datagram; returning true drops it.
    pub fn set_drop_filter(&mut self, direction: Direction, filter: DropFilter) {
        match direction {
            Direction::AtoB => self.a_to_b.filter = Some(filter),
            Direction::BtoA => self.b_to_a.filter = Some(filter),
        }
    }

    /// Hands a datagram to the link.
    pub fn transmit(&mut self, direction: Direction, data: Vec<u8>, now: Instant) {
        self.stats.transmitted += 1;

        if self.blackout {
            self.stats.dropped += 1;
            return;
        }
        let pipe = match direction {
            Direction::AtoB => &mut self.a_to_b,
            Direction::BtoA => &mut self.b_to_a,
        };
        if let Some(filter) = &mut pipe.filter {
            if filter(&data) {
                self.stats.dropped += 1;
                return;
            }
        }
        if self.rng.percent_roll() < self.conditions.packet_loss_percent {
            self.stats.dropped += 1;
            return;
        }

        let jitter = if self.conditions.jitter_ms > 0 {
            self.rng.next() % (self.conditions.jitter_ms * 2)
        } else {
            0
        };
        let mut delay = u64::from(self.conditions.base_latency_ms + jitter);
        if self.rng.percent_roll() < self.conditions.out_of_order_percent {
            // Push this one behind its successors.
            delay += 5 + u64::from(self.rng.next() % 20);
        }
        let ready = now + Duration::from_millis(delay);

        let duplicate = self.rng.percent_roll() < self.conditions.duplicate_percent;
        let pipe = match direction {
            Direction::AtoB => &mut self.a_to_b,
            Direction::BtoA => &mut self.b_to_a,
        };
        if duplicate {
            self.stats.duplicated += 1;
            pipe.in_flight
                .push((ready + Duration::from_millis(1), data.clone()));
        }
        pipe.in_flight.push((ready, data));
    }

    /// Takes every datagram due for delivery in one direction.
    pub fn deliver(&mut self, direction: Direction, now: Instant) -> Vec<Vec<u8>> {
        let pipe = match direction {
            Direction::AtoB => &mut self.a_to_b,
            Direction::BtoA => &mut self.b_to_a,
        };
        let mut due: Vec<(Instant, Vec<u8>)> = Vec::new();
        let mut remaining: Vec<(Instant, Vec<u8>)> = Vec::new();
        for item in pipe.in_flight.drain(..) {
            if item.0 <= now {
                due.push(item);
            } else {
                remaining.push(item);
            }
        }
        pipe.in_flight = remaining;
        due.sort_by_key(|(ready, _)| *ready);
        self.stats.delivered += due.len() as u64;
        due.into_iter().map(|(_, data)| data).collect()
    }

    /// Link statistics.
    #[must_use]
    pub const fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

/// Two sessions wired through a simulated link.
///
/// The scenario tests drive this with a virtual clock; production code
/// uses real endpoints instead.
pub struct LinkedPair {
    /// Endpoint A, the initiator.
    pub a: Session,
    /// Endpoint B, the acceptor.
    pub b: Session,
    /// The link between them.
    pub link: SimulatedLink,
}

impl LinkedPair {
    /// Wires two sessions through a link.
    #[must_use]
    pub fn new(a: Session, b: Session, link: SimulatedLink) -> Self {
        Self { a, b, link }
    }

    /// One simulation step: tick both sessions, move traffic both ways.
    pub fn step(&mut self, now: Instant) {
        for data in self.a.tick(now) {
            self.link.transmit(Direction::AtoB, data, now);
        }
        for data in self.b.tick(now) {
            self.link.transmit(Direction::BtoA, data, now);
        }
        for data in self.link.deliver(Direction::AtoB, now) {
            self.b.handle_datagram(&data, now);
        }
        for data in self.link.deliver(Direction::BtoA, now) {
            self.a.handle_datagram(&data, now);
        }
    }

    /// Runs `step` over a span of virtual time.
    pub fn run(&mut self, from: Instant, span: Duration, step: Duration) -> Instant {
        let mut now = from;
        let end = from + span;
        while now < end {
            self.step(now);
            now += step;
        }
        now
    }
}
