use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::waitqueue::WakerRegistration;
use embassy_time::{with_deadline, Duration, Instant};
use heapless::Vec;

use crate::bus::BusHandle;
use crate::error::{ArbiterError, ConfigError};
use crate::factory::BusFactory;
use crate::session::{DeviceConfig, DeviceSession, SessionId};
use crate::watchdog::StuckBus;

/// Opaque proof that a session currently owns the bus.
///
/// A ticket is valid from the `acquire` that returned it until the matching
/// [`BusArbiter::release`]. Copies of a released ticket are rejected with
/// [`ArbiterError::InvalidTicket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ticket {
    session: SessionId,
    grant: u32,
}

impl Ticket {
    /// The session this ticket was granted to.
    pub fn session(&self) -> SessionId {
        self.session
    }
}

/// Counters describing the arbiter's history since construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ArbiterStats {
    pub grants: u32,
    pub releases: u32,
    pub timeouts: u32,
    pub rejected: u32,
}

/// Lifecycle of the hardware port.
pub(crate) enum Phase<F: BusFactory> {
    /// Port is not configured; resources are available.
    Idle(F::Resources),
    /// Port is configured and owned here.
    Active { port: F::Port, destructor: F::Destructor },
    /// A factory call panicked midway; the resources are lost.
    Poisoned,
}

#[derive(Clone, Copy)]
enum Owner {
    Idle,
    Busy { session: SessionId, grant: u32, since: Instant, reported: bool },
}

struct Registration {
    session: SessionId,
    chip_select: u8,
}

struct Waiter {
    session: SessionId,
    waker: WakerRegistration,
}

struct State<const N: usize> {
    sessions: Vec<Registration, N>,
    /// Arrival order; the head is granted next.
    waiters: Vec<Waiter, N>,
    owner: Owner,
    stats: ArbiterStats,
}

impl<const N: usize> State<N> {
    const fn new() -> Self {
        Self {
            sessions: Vec::new(),
            waiters: Vec::new(),
            owner: Owner::Idle,
            stats: ArbiterStats {
                grants: 0,
                releases: 0,
                timeouts: 0,
                rejected: 0,
            },
        }
    }

    fn is_registered(&self, session: SessionId) -> bool {
        self.sessions.iter().any(|r| r.session == session)
    }

    fn position(&self, session: SessionId) -> Option<usize> {
        self.waiters.iter().position(|w| w.session == session)
    }

    fn active(&self) -> Option<SessionId> {
        match self.owner {
            Owner::Busy { session, .. } => Some(session),
            Owner::Idle => None,
        }
    }

    fn holds(&self, ticket: &Ticket) -> bool {
        matches!(
            self.owner,
            Owner::Busy { session, grant, .. }
                if session == ticket.session && grant == ticket.grant
        )
    }

    fn grant(&mut self, session: SessionId) -> Ticket {
        self.stats.grants = self.stats.grants.wrapping_add(1);
        let grant = self.stats.grants;
        self.owner = Owner::Busy {
            session,
            grant,
            since: Instant::now(),
            reported: false,
        };
        Ticket { session, grant }
    }

    /// Passes the bus to the head of the queue, or idles it.
    fn hand_off(&mut self) {
        if self.waiters.is_empty() {
            self.owner = Owner::Idle;
            return;
        }
        let mut next = self.waiters.remove(0);
        self.grant(next.session);
        next.waker.wake();
    }
}

/// Serializes access to one physical SPI bus across device sessions.
///
/// Sessions are granted the bus strictly in the order they asked for it.
/// The hardware port is lazily created on the first grant and can be torn
/// down again with [`deactivate`](Self::deactivate) while the bus is idle.
///
/// `N` bounds the number of registered sessions. Each session waits at most
/// once, so the wait queue never overflows.
pub struct BusArbiter<M: RawMutex, F: BusFactory, const N: usize> {
    bus: BusHandle,
    state: BlockingMutex<M, RefCell<State<N>>>,
    port: Mutex<M, Phase<F>>,
    watchdog: Duration,
}

impl<M: RawMutex, F: BusFactory, const N: usize> BusArbiter<M, F, N> {
    /// How long a grant may be held before the watchdog reports it.
    pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(2);

    /// Create an arbiter for `bus`; `resources` are consumed on first grant.
    pub const fn new(bus: BusHandle, resources: F::Resources) -> Self {
        Self {
            bus,
            state: BlockingMutex::new(RefCell::new(State::new())),
            port: Mutex::new(Phase::Idle(resources)),
            watchdog: Self::DEFAULT_WATCHDOG,
        }
    }

    /// Override the duration after which a held bus is reported as stuck.
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    pub(crate) fn register(
        &self,
        config: &DeviceConfig,
    ) -> Result<SessionId, ConfigError> {
        if config.frequency == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        if config.frequency > self.bus.max_frequency() {
            return Err(ConfigError::FrequencyTooHigh {
                requested: config.frequency,
                max: self.bus.max_frequency(),
            });
        }
        if self.bus.uses_pin(config.chip_select) {
            return Err(ConfigError::ChipSelectConflict {
                line: config.chip_select,
            });
        }

        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state
                .sessions
                .iter()
                .any(|r| r.chip_select == config.chip_select)
            {
                return Err(ConfigError::ChipSelectConflict {
                    line: config.chip_select,
                });
            }

            let session = SessionId::next();
            state
                .sessions
                .push(Registration {
                    session,
                    chip_select: config.chip_select,
                })
                .map_err(|_| ConfigError::TooManySessions)?;

            #[cfg(feature = "defmt")]
            defmt::info!(
                "spi{}: registered session {} on cs {} at {} Hz",
                self.bus.host(),
                session,
                config.chip_select,
                config.frequency
            );
            Ok(session)
        })
    }

    /// Remove `session` from the bus.
    ///
    /// Fails with [`ArbiterError::InUse`] while the session holds the bus.
    /// On failure the session is handed back so it is not lost.
    pub fn deregister(
        &self,
        session: DeviceSession,
    ) -> Result<(), (ArbiterError<F::Error>, DeviceSession)> {
        let id = session.id();
        let result = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let Some(index) =
                state.sessions.iter().position(|r| r.session == id)
            else {
                return Err(ArbiterError::UnknownSession);
            };
            if state.active() == Some(id) || state.position(id).is_some() {
                return Err(ArbiterError::InUse);
            }
            state.sessions.swap_remove(index);
            Ok(())
        });
        result.map_err(|err| (err, session))
    }

    /// Wait until the bus is free, then make `session` its active device.
    ///
    /// Waiters are served in arrival order. A session that already holds
    /// the bus, or is already waiting for it, is rejected with
    /// [`ArbiterError::Reentrancy`]. If `timeout` elapses first the session
    /// leaves the queue and [`ArbiterError::Timeout`] is returned.
    /// [`Duration::MAX`] waits without a deadline.
    ///
    /// Dropping the returned future withdraws the request; a grant that
    /// arrived in the meantime is passed on to the next waiter.
    pub async fn acquire(
        &self,
        session: &DeviceSession,
        timeout: Duration,
    ) -> Result<Ticket, ArbiterError<F::Error>> {
        let id = session.id();
        let granted = self.enqueue(id)?;
        let mut pending = Pending { arbiter: self, session: id, armed: true };

        let ticket = match granted {
            Some(ticket) => ticket,
            None => {
                let wait = poll_fn(|cx| self.poll_grant(id, cx));
                let outcome = match Instant::now().checked_add(timeout) {
                    Some(deadline) => with_deadline(deadline, wait).await,
                    // Past the end of the clock: wait without a deadline.
                    None => Ok(wait.await),
                };
                match outcome {
                    Ok(ticket) => ticket,
                    Err(_) => {
                        self.record_timeout(id);
                        return Err(ArbiterError::Timeout);
                    }
                }
            }
        };

        // First grant brings the hardware up.
        {
            let mut phase = self.port.lock().await;
            Self::ensure_active(&mut phase, &self.bus)?;
        }

        pending.armed = false;
        Ok(ticket)
    }

    /// Give the bus up and grant it to the longest waiting session, if any.
    pub fn release(&self, ticket: Ticket) -> Result<(), ArbiterError<F::Error>> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.holds(&ticket) {
                return Err(ArbiterError::InvalidTicket);
            }
            state.stats.releases = state.stats.releases.wrapping_add(1);
            state.hand_off();
            Ok(())
        })
    }

    /// Tear the hardware port down and recover its resources.
    ///
    /// Returns `Ok(())` if the port was torn down or was never created.
    /// Returns `Err(InUse)` while any session holds the bus.
    pub async fn deactivate(&self) -> Result<(), ArbiterError<F::Error>> {
        let mut phase = self.port.lock().await;
        if self.active_session().is_some() {
            return Err(ArbiterError::InUse);
        }

        match &*phase {
            Phase::Idle(_) => Ok(()),
            Phase::Active { .. } => {
                let Phase::Active { port, destructor } =
                    core::mem::replace(&mut *phase, Phase::Poisoned)
                else {
                    unreachable!()
                };
                drop(port);
                *phase = Phase::Idle(F::recover(destructor));

                #[cfg(feature = "defmt")]
                defmt::info!("spi{}: port deactivated", self.bus.host());
                Ok(())
            }
            Phase::Poisoned => Err(ArbiterError::Poisoned),
        }
    }

    /// The session currently holding the bus, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        self.state.lock(|state| state.borrow().active())
    }

    /// Number of sessions queued for the bus.
    pub fn waiting(&self) -> usize {
        self.state.lock(|state| state.borrow().waiters.len())
    }

    /// Number of registered sessions.
    pub fn sessions(&self) -> usize {
        self.state.lock(|state| state.borrow().sessions.len())
    }

    pub fn stats(&self) -> ArbiterStats {
        self.state.lock(|state| state.borrow().stats)
    }

    /// Whether the hardware port is up.
    ///
    /// `None` while a transfer holds the port or after it was poisoned;
    /// never waits.
    pub fn is_configured(&self) -> Option<bool> {
        self.port.try_lock().ok().and_then(|phase| match &*phase {
            Phase::Idle(_) => Some(false),
            Phase::Active { .. } => Some(true),
            Phase::Poisoned => None,
        })
    }

    /// Checks `ticket` is the live grant of `session`.
    pub(crate) fn validate(
        &self,
        ticket: &Ticket,
        session: SessionId,
    ) -> Result<(), ArbiterError<F::Error>> {
        let live = self.state.lock(|state| state.borrow().holds(ticket));
        if live && ticket.session == session {
            Ok(())
        } else {
            Err(ArbiterError::InvalidTicket)
        }
    }

    pub(crate) async fn lock_port(&self) -> MutexGuard<'_, M, Phase<F>> {
        self.port.lock().await
    }

    /// Creates the port if needed and returns it.
    pub(crate) fn ensure_active<'p>(
        phase: &'p mut Phase<F>,
        bus: &BusHandle,
    ) -> Result<&'p mut F::Port, ArbiterError<F::Error>> {
        if let Phase::Idle(_) = phase {
            // Poisoned stands in until the factory returns.
            let Phase::Idle(resources) =
                core::mem::replace(phase, Phase::Poisoned)
            else {
                unreachable!()
            };

            match F::create(resources, bus) {
                Ok((port, destructor)) => {
                    *phase = Phase::Active { port, destructor };

                    #[cfg(feature = "defmt")]
                    defmt::info!("spi{}: port activated", bus.host());
                }
                Err((err, resources)) => {
                    // Restore resources so the next grant can try again.
                    *phase = Phase::Idle(resources);
                    return Err(ArbiterError::Factory(err));
                }
            }
        }

        match phase {
            Phase::Active { port, .. } => Ok(port),
            Phase::Poisoned => Err(ArbiterError::Poisoned),
            Phase::Idle(_) => unreachable!(),
        }
    }

    /// Returns a report the first time the current grant outlives the
    /// watchdog duration.
    pub(crate) fn take_stuck(&self) -> Option<StuckBus> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let waiters = state.waiters.len();
            let Owner::Busy { session, since, ref mut reported, .. } =
                state.owner
            else {
                return None;
            };
            let held_for = since.elapsed();
            if *reported || held_for < self.watchdog {
                return None;
            }
            *reported = true;

            let chip_select = state
                .sessions
                .iter()
                .find(|r| r.session == session)
                .map(|r| r.chip_select);
            Some(StuckBus {
                host: self.bus.host(),
                session,
                chip_select,
                held_for,
                waiters,
            })
        })
    }

    /// Grants immediately if the bus is free, otherwise joins the queue.
    fn enqueue(
        &self,
        session: SessionId,
    ) -> Result<Option<Ticket>, ArbiterError<F::Error>> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.is_registered(session) {
                return Err(ArbiterError::UnknownSession);
            }
            if state.active() == Some(session)
                || state.position(session).is_some()
            {
                state.stats.rejected = state.stats.rejected.wrapping_add(1);
                return Err(ArbiterError::Reentrancy);
            }

            if matches!(state.owner, Owner::Idle) && state.waiters.is_empty()
            {
                return Ok(Some(state.grant(session)));
            }

            let waiter = Waiter { session, waker: WakerRegistration::new() };
            if state.waiters.push(waiter).is_err() {
                unreachable!("wait queue holds one entry per registered session");
            }
            Ok(None)
        })
    }

    fn poll_grant(&self, session: SessionId, cx: &mut Context<'_>) -> Poll<Ticket> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if let Some(index) = state.position(session) {
                state.waiters[index].waker.register(cx.waker());
                return Poll::Pending;
            }
            match state.owner {
                Owner::Busy { session: owner, grant, .. } if owner == session => {
                    Poll::Ready(Ticket { session, grant })
                }
                _ => unreachable!("waiter left the queue without a grant"),
            }
        })
    }

    fn record_timeout(&self, _session: SessionId) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.stats.timeouts = state.stats.timeouts.wrapping_add(1);

            #[cfg(feature = "defmt")]
            if let Owner::Busy { session, since, .. } = state.owner {
                defmt::warn!(
                    "spi{}: session {} timed out, bus held by {} for {} ms",
                    self.bus.host(),
                    _session,
                    session,
                    since.elapsed().as_millis()
                );
            }
        })
    }

    /// Leaves the queue, or passes on a grant nobody will collect.
    fn withdraw(&self, session: SessionId) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if let Some(index) = state.position(session) {
                state.waiters.remove(index);
            } else if state.active() == Some(session) {
                state.hand_off();
            }
        })
    }
}

/// Undoes a pending acquisition unless disarmed.
struct Pending<'a, M: RawMutex, F: BusFactory, const N: usize> {
    arbiter: &'a BusArbiter<M, F, N>,
    session: SessionId,
    armed: bool,
}

impl<M: RawMutex, F: BusFactory, const N: usize> Drop for Pending<'_, M, F, N> {
    fn drop(&mut self) {
        if self.armed {
            self.arbiter.withdraw(self.session);
        }
    }
}
