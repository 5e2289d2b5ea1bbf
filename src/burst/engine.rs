// Licensed under the Apache-2.0 license

//! Generic chunking engine shared by all controllers.
//!
//! The engine owns the shot arithmetic and the queue bookkeeping; the
//! controller callbacks own the wire protocol. A failing shot aborts the
//! remainder of the burst and nothing reports partial success.

use zerocopy::FromBytes;

use crate::burst::{BurstFlags, BurstHeader, BurstKind, BurstLimits, CommandHeader, ShotCtx};
use crate::error::{Error, Result};

/// Controller callback set. This is the only polymorphism seam between the
/// engine and the hardware.
pub trait BurstShots {
    /// Chunking geometry for a burst carrying `flags`.
    fn limits(&self, flags: BurstFlags) -> BurstLimits;

    /// Runs once before the first shot of a burst.
    fn handle_pre_burst_flags(&mut self, ctx: &ShotCtx) -> Result<()>;

    /// Runs once after the last shot of a burst.
    fn handle_post_burst_flags(&mut self, ctx: &ShotCtx) -> Result<()>;

    /// Pushes one write shot to the device.
    fn write_shot(&mut self, ctx: &ShotCtx, data: &[u8]) -> Result<()>;

    /// Queues a read request for `len` bytes ahead of consumption.
    fn request_read(&mut self, ctx: &ShotCtx, len: usize) -> Result<()>;

    /// Consumes one previously requested shot into `buf`.
    fn read_shot(&mut self, ctx: &ShotCtx, buf: &mut [u8]) -> Result<()>;

    /// Blocks until the device write queue has drained.
    fn wait_for_write_queue_empty(&mut self) -> Result<()>;

    /// Controller-specific command dispatch.
    fn execute_command(&mut self, command_id: u32, argument: u32, payload: &[u8]) -> Result<()> {
        let _ = (command_id, argument, payload);
        Err(Error::InvalidOperation)
    }

    /// Called when a burst failed mid-flight. Hardware is left as last
    /// observed; this hook brings the controller-side state (selected
    /// banks, chip selects) back to a defined baseline.
    fn burst_aborted(&mut self);

    /// Returns the controller to a known idle state at teardown.
    fn cleanup(&mut self);
}

/// Burst entry points, provided for every [`BurstShots`] implementor.
pub trait BurstTransfers: BurstShots {
    /// Splits `data` into shots and pushes them through [`write_shot`].
    ///
    /// The write queue is drained every `write_queue_size` shots and once
    /// more at the end when the shot count is not a multiple of it.
    ///
    /// [`write_shot`]: BurstShots::write_shot
    fn write_burst(&mut self, header: &BurstHeader, data: &[u8]) -> Result<()> {
        if header.kind != BurstKind::Write {
            return Err(Error::InvalidOperation);
        }
        if data.is_empty() || header.length != data.len() {
            return Err(Error::InvalidArgument);
        }
        let limits = self.limits(header.flags);
        let shot_len = limits.max_bytes_per_write.max(1);
        let queue = limits.write_queue_size.max(1);
        let shots = data.len().div_ceil(shot_len);

        let pre = ShotCtx {
            flags: header.flags,
            is_first_shot: true,
            is_last_shot: shots == 1,
        };
        if let Err(e) = self.handle_pre_burst_flags(&pre) {
            self.burst_aborted();
            return Err(e);
        }

        let mut since_drain = 0;
        for (index, chunk) in data.chunks(shot_len).enumerate() {
            let ctx = ShotCtx {
                flags: header.flags,
                is_first_shot: index == 0,
                is_last_shot: index + 1 == shots,
            };
            if let Err(e) = self.write_shot(&ctx, chunk) {
                self.burst_aborted();
                return Err(e);
            }
            since_drain += 1;
            if since_drain == queue {
                since_drain = 0;
                if let Err(e) = self.wait_for_write_queue_empty() {
                    self.burst_aborted();
                    return Err(e);
                }
            }
        }
        if since_drain != 0 {
            if let Err(e) = self.wait_for_write_queue_empty() {
                self.burst_aborted();
                return Err(e);
            }
        }

        let post = ShotCtx {
            flags: header.flags,
            is_first_shot: shots == 1,
            is_last_shot: true,
        };
        if let Err(e) = self.handle_post_burst_flags(&post) {
            self.burst_aborted();
            return Err(e);
        }
        Ok(())
    }

    /// Double-buffered read pipeline.
    ///
    /// Up to `read_queue_size` requests are issued before the first shot is
    /// consumed, keeping a slow bus's FIFO full; afterwards the engine
    /// alternates consuming one shot and issuing the next pending request,
    /// which hides the per-shot round-trip latency. The request and consume
    /// cursors each carry their own first/last view of the burst.
    fn read_burst(&mut self, header: &BurstHeader, buf: &mut [u8]) -> Result<()> {
        if header.kind != BurstKind::Read {
            return Err(Error::InvalidOperation);
        }
        if buf.is_empty() || header.length != buf.len() {
            return Err(Error::InvalidArgument);
        }
        let limits = self.limits(header.flags);
        let shot_len = limits.max_bytes_per_read.max(1);
        let queue = limits.read_queue_size.max(1);
        let total = buf.len();
        let shots = total.div_ceil(shot_len);

        let pre = ShotCtx {
            flags: header.flags,
            is_first_shot: true,
            is_last_shot: shots == 1,
        };
        if let Err(e) = self.handle_pre_burst_flags(&pre) {
            self.burst_aborted();
            return Err(e);
        }

        let mut bytes_to_request = total;
        let mut bytes_to_read = total;
        let mut request_index = 0;

        while request_index < shots.min(queue) {
            let len = shot_len.min(bytes_to_request);
            let ctx = ShotCtx {
                flags: header.flags,
                is_first_shot: request_index == 0,
                is_last_shot: request_index + 1 == shots,
            };
            if let Err(e) = self.request_read(&ctx, len) {
                self.burst_aborted();
                return Err(e);
            }
            bytes_to_request -= len;
            request_index += 1;
        }

        for (consume_index, chunk) in buf.chunks_mut(shot_len).enumerate() {
            debug_assert!(bytes_to_read >= bytes_to_request);
            let ctx = ShotCtx {
                flags: header.flags,
                is_first_shot: consume_index == 0,
                is_last_shot: consume_index + 1 == shots,
            };
            if let Err(e) = self.read_shot(&ctx, chunk) {
                self.burst_aborted();
                return Err(e);
            }
            bytes_to_read -= chunk.len();
            if bytes_to_request > 0 {
                let len = shot_len.min(bytes_to_request);
                let ctx = ShotCtx {
                    flags: header.flags,
                    is_first_shot: request_index == 0,
                    is_last_shot: request_index + 1 == shots,
                };
                if let Err(e) = self.request_read(&ctx, len) {
                    self.burst_aborted();
                    return Err(e);
                }
                bytes_to_request -= len;
                request_index += 1;
            }
        }

        let post = ShotCtx {
            flags: header.flags,
            is_first_shot: shots == 1,
            is_last_shot: true,
        };
        if let Err(e) = self.handle_post_burst_flags(&post) {
            self.burst_aborted();
            return Err(e);
        }
        Ok(())
    }

    /// Payload-less transition: pre-flags, then post-flags.
    ///
    /// Post-flags run even when pre-flags failed; the first error wins.
    fn state_change_burst(&mut self, header: &BurstHeader) -> Result<()> {
        if header.kind != BurstKind::StateChange {
            return Err(Error::InvalidOperation);
        }
        let ctx = ShotCtx {
            flags: header.flags,
            is_first_shot: true,
            is_last_shot: true,
        };
        let pre = self.handle_pre_burst_flags(&ctx);
        let post = self.handle_post_burst_flags(&ctx);
        pre.and(post)
    }

    /// Parses the fixed-size command header off `payload` and dispatches to
    /// [`execute_command`]. Controllers without command support reject with
    /// [`Error::InvalidOperation`].
    ///
    /// [`execute_command`]: BurstShots::execute_command
    fn command_execution_burst(&mut self, header: &BurstHeader, payload: &[u8]) -> Result<()> {
        if header.kind != BurstKind::CommandExec {
            return Err(Error::InvalidOperation);
        }
        let (command, rest) =
            CommandHeader::read_from_prefix(payload).map_err(|_| Error::InvalidArgument)?;
        self.execute_command(command.command_id.get(), command.argument.get(), rest)
    }
}

impl<T: BurstShots + ?Sized> BurstTransfers for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst::BurstFlags;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Pre { first: bool, last: bool },
        Post { first: bool, last: bool },
        Write { first: bool, last: bool, len: usize },
        Request { first: bool, last: bool, len: usize },
        Read { first: bool, last: bool, len: usize },
        Drain,
        Command { id: u32, argument: u32, payload_len: usize },
        Aborted,
    }

    struct Scripted {
        limits: BurstLimits,
        calls: Vec<Call>,
        fail_on_write_shot: Option<usize>,
        fail_pre: bool,
        post_result: Result<()>,
        writes_seen: usize,
    }

    impl Scripted {
        fn new(limits: BurstLimits) -> Self {
            Self {
                limits,
                calls: Vec::new(),
                fail_on_write_shot: None,
                fail_pre: false,
                post_result: Ok(()),
                writes_seen: 0,
            }
        }

        fn count<F: Fn(&Call) -> bool>(&self, pred: F) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl BurstShots for Scripted {
        fn limits(&self, _flags: BurstFlags) -> BurstLimits {
            self.limits
        }

        fn handle_pre_burst_flags(&mut self, ctx: &ShotCtx) -> Result<()> {
            self.calls.push(Call::Pre {
                first: ctx.is_first_shot,
                last: ctx.is_last_shot,
            });
            if self.fail_pre {
                return Err(Error::InvalidState);
            }
            Ok(())
        }

        fn handle_post_burst_flags(&mut self, ctx: &ShotCtx) -> Result<()> {
            self.calls.push(Call::Post {
                first: ctx.is_first_shot,
                last: ctx.is_last_shot,
            });
            self.post_result
        }

        fn write_shot(&mut self, ctx: &ShotCtx, data: &[u8]) -> Result<()> {
            self.calls.push(Call::Write {
                first: ctx.is_first_shot,
                last: ctx.is_last_shot,
                len: data.len(),
            });
            self.writes_seen += 1;
            if self.fail_on_write_shot == Some(self.writes_seen) {
                return Err(Error::DeviceIo);
            }
            Ok(())
        }

        fn request_read(&mut self, ctx: &ShotCtx, len: usize) -> Result<()> {
            self.calls.push(Call::Request {
                first: ctx.is_first_shot,
                last: ctx.is_last_shot,
                len,
            });
            Ok(())
        }

        fn read_shot(&mut self, ctx: &ShotCtx, buf: &mut [u8]) -> Result<()> {
            self.calls.push(Call::Read {
                first: ctx.is_first_shot,
                last: ctx.is_last_shot,
                len: buf.len(),
            });
            Ok(())
        }

        fn wait_for_write_queue_empty(&mut self) -> Result<()> {
            self.calls.push(Call::Drain);
            Ok(())
        }

        fn execute_command(
            &mut self,
            command_id: u32,
            argument: u32,
            payload: &[u8],
        ) -> Result<()> {
            self.calls.push(Call::Command {
                id: command_id,
                argument,
                payload_len: payload.len(),
            });
            Ok(())
        }

        fn burst_aborted(&mut self) {
            self.calls.push(Call::Aborted);
        }

        fn cleanup(&mut self) {}
    }

    fn limits(write: usize, read: usize, wq: usize, rq: usize) -> BurstLimits {
        BurstLimits {
            max_bytes_per_write: write,
            max_bytes_per_read: read,
            write_queue_size: wq,
            read_queue_size: rq,
        }
    }

    #[test]
    fn write_burst_shot_count_and_edge_flags() {
        for n in [1usize, 3, 4, 5, 9] {
            let mut ctrl = Scripted::new(limits(4, 4, 8, 1));
            let data = vec![0u8; n];
            let header = BurstHeader::write(BurstFlags::empty(), n);
            ctrl.write_burst(&header, &data).unwrap();

            let shots = n.div_ceil(4);
            assert_eq!(
                ctrl.count(|c| matches!(c, Call::Write { .. })),
                shots,
                "n={n}"
            );
            assert_eq!(
                ctrl.count(|c| matches!(c, Call::Write { first: true, .. })),
                1
            );
            assert_eq!(
                ctrl.count(|c| matches!(c, Call::Write { last: true, .. })),
                1
            );
            // First and last coincide exactly when one shot covers everything.
            let single = ctrl.count(|c| matches!(
                c,
                Call::Write {
                    first: true,
                    last: true,
                    ..
                }
            ));
            assert_eq!(single, usize::from(n <= 4));
        }
    }

    #[test]
    fn write_burst_drains_queue_on_boundary_and_tail() {
        // 5 single-byte shots, queue of 2: drain after shots 2 and 4, then
        // once more for the tail.
        let mut ctrl = Scripted::new(limits(1, 1, 2, 1));
        let header = BurstHeader::write(BurstFlags::empty(), 5);
        ctrl.write_burst(&header, &[0; 5]).unwrap();
        assert_eq!(ctrl.count(|c| matches!(c, Call::Drain)), 3);

        // 4 shots, queue of 2: boundary drains only.
        let mut ctrl = Scripted::new(limits(1, 1, 2, 1));
        let header = BurstHeader::write(BurstFlags::empty(), 4);
        ctrl.write_burst(&header, &[0; 4]).unwrap();
        assert_eq!(ctrl.count(|c| matches!(c, Call::Drain)), 2);
    }

    #[test]
    fn write_burst_aborts_on_shot_failure() {
        let mut ctrl = Scripted::new(limits(1, 1, 8, 1));
        ctrl.fail_on_write_shot = Some(2);
        let header = BurstHeader::write(BurstFlags::empty(), 4);
        let result = ctrl.write_burst(&header, &[0; 4]);
        assert_eq!(result, Err(Error::DeviceIo));
        assert_eq!(ctrl.count(|c| matches!(c, Call::Aborted)), 1);
        assert_eq!(ctrl.count(|c| matches!(c, Call::Write { .. })), 2);
        // No post flags after an abort.
        assert_eq!(ctrl.count(|c| matches!(c, Call::Post { .. })), 0);
    }

    #[test]
    fn write_burst_rejects_bad_input() {
        let mut ctrl = Scripted::new(limits(1, 1, 1, 1));
        let header = BurstHeader::write(BurstFlags::empty(), 0);
        assert_eq!(ctrl.write_burst(&header, &[]), Err(Error::InvalidArgument));
        let header = BurstHeader::read(BurstFlags::empty(), 4);
        assert_eq!(
            ctrl.write_burst(&header, &[0; 4]),
            Err(Error::InvalidOperation)
        );
        let header = BurstHeader::write(BurstFlags::empty(), 3);
        assert_eq!(
            ctrl.write_burst(&header, &[0; 4]),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn read_burst_primes_queue_before_consuming() {
        let mut ctrl = Scripted::new(limits(1, 1, 1, 2));
        let header = BurstHeader::read(BurstFlags::empty(), 4);
        let mut buf = [0u8; 4];
        ctrl.read_burst(&header, &mut buf).unwrap();

        let interesting: Vec<&Call> = ctrl
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Request { .. } | Call::Read { .. }))
            .collect();
        // Two requests in flight before the first consume, then strict
        // consume/request alternation.
        assert!(matches!(interesting[0], Call::Request { first: true, .. }));
        assert!(matches!(interesting[1], Call::Request { .. }));
        assert!(matches!(interesting[2], Call::Read { first: true, .. }));
        assert!(matches!(interesting[3], Call::Request { .. }));
        assert!(matches!(interesting[4], Call::Read { .. }));
        assert!(matches!(interesting[5], Call::Request { last: true, .. }));
        assert!(matches!(interesting[6], Call::Read { .. }));
        assert!(matches!(interesting[7], Call::Read { last: true, .. }));
        assert_eq!(interesting.len(), 8);
    }

    #[test]
    fn read_burst_request_and_consume_cover_total() {
        let mut ctrl = Scripted::new(limits(1, 4, 1, 3));
        let header = BurstHeader::read(BurstFlags::empty(), 10);
        let mut buf = [0u8; 10];
        ctrl.read_burst(&header, &mut buf).unwrap();

        let requested: usize = ctrl
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Request { len, .. } => Some(*len),
                _ => None,
            })
            .sum();
        let consumed: usize = ctrl
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Read { len, .. } => Some(*len),
                _ => None,
            })
            .sum();
        assert_eq!(requested, 10);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn state_change_runs_post_flags_after_pre_failure() {
        let mut ctrl = Scripted::new(limits(1, 1, 1, 1));
        ctrl.fail_pre = true;
        let header = BurstHeader::state_change(BurstFlags::empty());
        assert_eq!(ctrl.state_change_burst(&header), Err(Error::InvalidState));
        assert_eq!(ctrl.count(|c| matches!(c, Call::Post { .. })), 1);
    }

    #[test]
    fn state_change_surfaces_post_failure() {
        let mut ctrl = Scripted::new(limits(1, 1, 1, 1));
        ctrl.post_result = Err(Error::DeviceIo);
        let header = BurstHeader::state_change(BurstFlags::empty());
        assert_eq!(ctrl.state_change_burst(&header), Err(Error::DeviceIo));
    }

    #[test]
    fn command_burst_parses_header_and_forwards_payload() {
        let mut ctrl = Scripted::new(limits(1, 1, 1, 1));
        let header = BurstHeader::command(BurstFlags::empty(), 11);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x11u32.to_le_bytes());
        payload.extend_from_slice(&0x2233u32.to_le_bytes());
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        ctrl.command_execution_burst(&header, &payload).unwrap();
        assert_eq!(
            ctrl.calls,
            vec![Call::Command {
                id: 0x11,
                argument: 0x2233,
                payload_len: 3
            }]
        );
    }

    #[test]
    fn command_burst_rejects_short_payload() {
        let mut ctrl = Scripted::new(limits(1, 1, 1, 1));
        let header = BurstHeader::command(BurstFlags::empty(), 3);
        assert_eq!(
            ctrl.command_execution_burst(&header, &[0; 3]),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn execute_command_defaults_to_invalid_operation() {
        struct Bare;
        impl BurstShots for Bare {
            fn limits(&self, _flags: BurstFlags) -> BurstLimits {
                limits(1, 1, 1, 1)
            }
            fn handle_pre_burst_flags(&mut self, _ctx: &ShotCtx) -> Result<()> {
                Ok(())
            }
            fn handle_post_burst_flags(&mut self, _ctx: &ShotCtx) -> Result<()> {
                Ok(())
            }
            fn write_shot(&mut self, _ctx: &ShotCtx, _data: &[u8]) -> Result<()> {
                Ok(())
            }
            fn request_read(&mut self, _ctx: &ShotCtx, _len: usize) -> Result<()> {
                Ok(())
            }
            fn read_shot(&mut self, _ctx: &ShotCtx, _buf: &mut [u8]) -> Result<()> {
                Ok(())
            }
            fn wait_for_write_queue_empty(&mut self) -> Result<()> {
                Ok(())
            }
            fn burst_aborted(&mut self) {}
            fn cleanup(&mut self) {}
        }

        let mut bare = Bare;
        let header = BurstHeader::command(BurstFlags::empty(), 8);
        assert_eq!(
            bare.command_execution_burst(&header, &[0; 8]),
            Err(Error::InvalidOperation)
        );
    }
}
