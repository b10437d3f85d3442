//! Single-threaded control loop (spec §4.6).
//!
//! Ordering within one iteration is fixed: fsck fork check, culling phase,
//! reap phase. Everything else — signal delivery, kernel channel state — is
//! read at the top of the loop and acted on in that order.

use std::os::unix::io::AsRawFd;

use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::SigSet;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};
use log::{info, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::fsck;
use crate::queue::Queue;
use crate::reaper;
use crate::signals;
use crate::state::{State, StateFlags};

/// Seconds between a queue build/refresh and its follow-up refresh alarm
/// (spec §4.6: "arm a 30-second refresh alarm").
const REFRESH_INTERVAL_SECS: u32 = 30;

pub struct ControlLoop<'a> {
    state: &'a mut State,
    queue: &'a mut Queue,
    channel: &'a mut Channel,
    nocull: bool,
    /// Set at startup and whenever the queue drains to empty; causes the
    /// next `cull=1` (or the very first iteration) to rebuild it.
    jumpstart: bool,
    fsck_child: Option<nix::unistd::Pid>,
}

impl<'a> ControlLoop<'a> {
    pub fn new(state: &'a mut State, queue: &'a mut Queue, channel: &'a mut Channel, nocull: bool) -> Self {
        ControlLoop {
            state,
            queue,
            channel,
            nocull,
            jumpstart: true,
            fsck_child: None,
        }
    }

    /// Runs until `SIGTERM`/`SIGINT` is observed or an unrecoverable error
    /// occurs (spec §4.6, §5 "Cancellation").
    pub fn run(&mut self) -> Result<()> {
        signals::block_watched()?;

        loop {
            if signals::take_stop() {
                break;
            }

            self.reap_fsck_child()?;

            let kstate = self.channel.read_state()?;

            if self.state.need_fsck() && !self.state.flags.contains(StateFlags::FSCK_RUNNING) {
                self.fork_fsck()?;
            }

            if !self.nocull {
                self.run_culling_phase(&kstate)?;
            }

            if signals::take_reap() {
                reaper::reap(self.state)?;
            }

            if signals::take_stop() {
                break;
            }

            if !self.has_pending_work(&kstate) {
                self.suspend()?;
            }
        }

        Ok(())
    }

    fn run_culling_phase(&mut self, kstate: &crate::channel::ChannelState) -> Result<()> {
        let refresh_requested = signals::take_refresh();

        if self.jumpstart && self.queue.is_empty() {
            self.queue.build(self.state, true)?;
            self.jumpstart = false;
            arm_refresh_alarm();
        } else if refresh_requested && !self.queue.is_empty() && self.queue_is_ready() {
            self.queue.refresh(self.state)?;
            arm_refresh_alarm();
        }

        if kstate.cull {
            if self.queue_is_ready() {
                let drained = self.queue.cull(self.state, self.channel)?;
                if drained == 0 {
                    self.jumpstart = true;
                }
                if self.queue.is_thrashing() {
                    return Err(crate::error::Error::internal(
                        "cull queue thrashing: exceeded consecutive fruitless drains",
                    ));
                }
            } else {
                self.jumpstart = true;
                self.queue.build(self.state, true)?;
                arm_refresh_alarm();
            }
        }

        Ok(())
    }

    fn queue_is_ready(&self) -> bool {
        self.queue.ready
    }

    fn has_pending_work(&self, kstate: &crate::channel::ChannelState) -> bool {
        (self.state.need_fsck() && !self.state.flags.contains(StateFlags::FSCK_RUNNING))
            || kstate.cull
            || kstate.fsck
    }

    /// Forks the deep fsck as a child that works the index files (and, if
    /// bound, the kernel channel) to completion, then exits (spec §4.6
    /// step 1, §5 "one optional forked child").
    fn fork_fsck(&mut self) -> Result<()> {
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                self.fsck_child = Some(child);
                self.state.flags.insert(StateFlags::FSCK_RUNNING);
                Ok(())
            }
            ForkResult::Child => {
                // spec §4.5: the deep scan runs niced down so it doesn't
                // compete with the kernel's own I/O priority.
                if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 19) } < 0 {
                    warn!("setpriority(19) failed: {}", std::io::Error::last_os_error());
                }
                let rc = match fsck::run(self.state, Some(self.channel)) {
                    Ok(report) => {
                        info!(
                            "fsck complete: {} fixes, {} deletions",
                            report.fixes, report.deletions
                        );
                        0
                    }
                    Err(e) => {
                        warn!("fsck failed: {e}");
                        1
                    }
                };
                let _ = self.channel.fsck_result(rc);
                std::process::exit(rc);
            }
        }
    }

    /// Reaps the fsck child's exit status, if it has one ready (non-blocking
    /// — the parent never waits on the child, per spec §5 "the child's
    /// non-zero exit sets `stop`" being the only coupling).
    fn reap_fsck_child(&mut self) -> Result<()> {
        let Some(pid) = self.fsck_child else {
            return Ok(());
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(()),
            Ok(WaitStatus::Exited(_, code)) => {
                self.fsck_child = None;
                self.state.flags.remove(StateFlags::FSCK_RUNNING);
                self.state.flags.remove(StateFlags::NEED_FSCK);
                if code != 0 {
                    warn!("fsck child exited with status {code}");
                    signals::request_stop();
                }
                Ok(())
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.fsck_child = None;
                self.state.flags.remove(StateFlags::FSCK_RUNNING);
                warn!("fsck child killed by signal {sig:?}");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::ECHILD) => {
                self.fsck_child = None;
                self.state.flags.remove(StateFlags::FSCK_RUNNING);
                Ok(())
            }
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    /// Blocks on the channel fd, with the watched signal set unblocked only
    /// for the duration of the suspension (spec §4.6, §5 "Suspension
    /// points").
    fn suspend(&mut self) -> Result<()> {
        let fd = self.channel.as_raw_fd();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        // Unblock the watched set only for this call, so a signal arriving
        // while we're otherwise busy can't be missed between unblock and
        // poll (spec §4.6: "blocked except during the poll suspension").
        match ppoll(&mut fds, None, Some(SigSet::empty())) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}

fn arm_refresh_alarm() {
    unsafe {
        libc::alarm(REFRESH_INTERVAL_SECS);
    }
}
