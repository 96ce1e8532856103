use crate::{
    engine::{ChordEngine, Output},
    io::OutputSink,
    scheduler::{Backend, Ready},
};
use anyhow::Result;
use log::{debug, info};
use std::io::Write;

/// The single coordinator: everything that touches engine state goes through
/// here one event at a time.
pub(crate) struct Pipeline<B, W> {
    engine: ChordEngine<B>,
    sink: OutputSink<W>,
}

impl<B: Backend, W: Write> Pipeline<B, W> {
    pub fn new(engine: ChordEngine<B>, sink: OutputSink<W>) -> Self {
        Self { engine, sink }
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            let ready = self.engine.scheduler_mut().next_ready()?;
            if !self.process(ready)? {
                break;
            }
        }

        let held = self.engine.scheduler_mut().outstanding();
        if held > 0 {
            debug!("Input ended with {held} press(es) held back, waiting them out");
        }
        while let Some(ready) = self.engine.scheduler_mut().wait_due() {
            self.process(ready)?;
        }

        info!("Input ended");
        Ok(())
    }

    /// Handles one frame or fired action. `false` once input has ended.
    fn process(&mut self, ready: Ready) -> Result<bool> {
        let outputs = match ready {
            Ready::Frame(frame) => self.engine.on_frame(frame),
            Ready::Fired { handle, key } => {
                let out = self.engine.on_fired(handle, key);
                debug_assert!(self.engine.invariant_holds());
                out
            }
            Ready::End => return Ok(false),
        };

        for output in outputs {
            match output {
                Output::Passthrough(frame) => self.sink.passthrough(&frame)?,
                Output::Key { key, value, origin } => self.sink.emit_key(key, value, origin)?,
            }
        }

        Ok(true)
    }

    #[cfg(test)]
    fn sink(&self) -> &OutputSink<W> {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FRAME_SIZE, InputEventFrame, PRESS, RELEASE};
    use crate::engine::tests::{press, release, rule};
    use crate::io::EventStream;
    use crate::io::tests::frames;
    use crate::scheduler::cooperative::DeadlineQueue;
    use crate::scheduler::poll::PollLoop;
    use crate::scheduler::tests::ManualScheduler;
    use crate::scheduler::threads::ThreadTimers;
    use crate::scheduler::{DeadlineTable, Handle, Scheduler};
    use evdev::KeyCode;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::{Duration, Instant};

    const Q: KeyCode = KeyCode::KEY_Q;
    const X: KeyCode = KeyCode::KEY_X;
    const S: KeyCode = KeyCode::KEY_S;
    const U: KeyCode = KeyCode::KEY_U;

    enum Step {
        Frame(InputEventFrame),
        Elapse(KeyCode),
    }

    /// Plays back frames and threshold expiries in a fixed order.
    struct Script {
        scheduler: ManualScheduler,
        steps: VecDeque<Step>,
    }

    impl Script {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                scheduler: ManualScheduler::default(),
                steps: steps.into(),
            }
        }
    }

    impl Scheduler for Script {
        fn schedule(&mut self, key: KeyCode, delay: Duration) -> Handle {
            self.scheduler.schedule(key, delay)
        }

        fn cancel(&mut self, handle: Handle) {
            self.scheduler.cancel(handle)
        }

        fn is_pending(&self, handle: Handle) -> bool {
            self.scheduler.is_pending(handle)
        }
    }

    impl Backend for Script {
        fn next_ready(&mut self) -> Result<Ready> {
            while let Some(step) = self.steps.pop_front() {
                match step {
                    Step::Frame(frame) => return Ok(Ready::Frame(frame)),
                    Step::Elapse(key) => {
                        // Cancelled actions never surface.
                        if let Some((handle, key)) = self.scheduler.fire(key) {
                            return Ok(Ready::Fired { handle, key });
                        }
                    }
                }
            }
            Ok(Ready::End)
        }

        fn outstanding(&self) -> usize {
            self.scheduler.outstanding()
        }

        fn deadlines_mut(&mut self) -> &mut DeadlineTable {
            self.scheduler.table_mut()
        }
    }

    fn scripted(steps: Vec<Step>) -> Pipeline<Script, Vec<u8>> {
        let engine = ChordEngine::new(&rule(&[Q, X], S), Script::new(steps));
        Pipeline::new(engine, OutputSink::new(Vec::new(), Duration::ZERO))
    }

    /// (code, value) of every written frame, SYN included.
    fn written<B: Backend>(pipeline: &Pipeline<B, Vec<u8>>) -> Vec<(u16, u32)> {
        frames(pipeline.sink().get_ref())
            .iter()
            .map(|frame| (frame.code, frame.value))
            .collect()
    }

    const SYN: (u16, u32) = (0, 0);

    fn key(key: KeyCode, value: u32) -> (u16, u32) {
        (key.code(), value)
    }

    #[test]
    fn test_fast_tap_bytes() {
        let mut pipeline = scripted(vec![
            Step::Frame(press(Q)),
            Step::Frame(release(Q)),
            Step::Elapse(Q),
        ]);
        pipeline.run().unwrap();

        assert_eq!(
            written(&pipeline),
            vec![key(Q, PRESS), SYN, key(Q, RELEASE)]
        );
        // The release keeps the timestamp it was read with.
        let out = frames(pipeline.sink().get_ref());
        assert_eq!(out[2], release(Q));
    }

    #[test]
    fn test_chord_bytes() {
        let mut pipeline = scripted(vec![
            Step::Frame(press(Q)),
            Step::Frame(InputEventFrame::syn()),
            Step::Frame(press(X)),
            Step::Frame(InputEventFrame::syn()),
            Step::Elapse(Q),
            Step::Elapse(X),
            Step::Frame(release(Q)),
            Step::Frame(release(X)),
        ]);
        pipeline.run().unwrap();

        assert_eq!(
            written(&pipeline),
            vec![SYN, key(S, PRESS), SYN, SYN, key(S, RELEASE), SYN]
        );
    }

    #[test]
    fn test_timeout_and_interrupt_bytes() {
        let mut pipeline = scripted(vec![
            Step::Frame(press(Q)),
            Step::Elapse(Q),
            Step::Frame(release(Q)),
            Step::Frame(press(X)),
            Step::Frame(press(U)),
            Step::Frame(release(U)),
            Step::Frame(release(X)),
        ]);
        pipeline.run().unwrap();

        assert_eq!(
            written(&pipeline),
            vec![
                key(Q, PRESS),
                SYN,
                key(Q, RELEASE),
                key(X, PRESS),
                SYN,
                key(U, PRESS),
                key(U, RELEASE),
                key(X, RELEASE),
            ]
        );
    }

    #[test]
    fn test_held_press_is_delivered_after_end_of_input() {
        let mut pipeline = scripted(vec![Step::Frame(press(Q))]);
        let started = Instant::now();
        pipeline.run().unwrap();

        assert_eq!(written(&pipeline), vec![key(Q, PRESS), SYN]);
        assert!(started.elapsed() >= Duration::from_millis(140));
        assert_eq!(pipeline.engine.scheduler_mut().outstanding(), 0);
    }

    #[test]
    fn test_held_press_after_end_of_input_on_thread_timers() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let backend = ThreadTimers::spawn(EventStream::new(reader));
        let engine = ChordEngine::new(&rule(&[Q, X], S), backend);
        let mut pipeline = Pipeline::new(engine, OutputSink::new(Vec::new(), Duration::ZERO));

        writer.write_all(&press(Q).encode()).unwrap();
        drop(writer);
        pipeline.run().unwrap();

        assert_eq!(written(&pipeline), vec![key(Q, PRESS), SYN]);
    }

    #[test]
    fn test_truncated_input_is_fatal() {
        let mut bytes = InputEventFrame::syn().encode().to_vec();
        bytes.extend_from_slice(&[0u8; FRAME_SIZE / 2]);
        let backend = ThreadTimers::spawn(EventStream::new(Cursor::new(bytes)));
        let engine = ChordEngine::new(&rule(&[Q, X], S), backend);
        let mut pipeline = Pipeline::new(engine, OutputSink::new(Vec::new(), Duration::ZERO));

        assert!(pipeline.run().is_err());
        assert_eq!(written(&pipeline), vec![SYN]);
    }

    /// Drives a real backend with wall-clock timing.
    fn live_session<B: Backend>(
        make: impl FnOnce(EventStream<UnixStream>) -> B,
    ) -> Vec<(u16, u32)> {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let engine = ChordEngine::new(&rule(&[Q, X], S), make(EventStream::new(reader)));
        let mut pipeline = Pipeline::new(engine, OutputSink::new(Vec::new(), Duration::ZERO));

        let feeder = thread::spawn(move || {
            let mut send = |frame: InputEventFrame, pause_ms: u64| {
                writer.write_all(&frame.encode()).unwrap();
                thread::sleep(Duration::from_millis(pause_ms));
            };
            // Chord: X lands 20ms after Q.
            send(press(Q), 20);
            send(press(X), 30);
            send(release(Q), 10);
            send(release(X), 30);
            // Plain hold: Q alone outlives the threshold.
            send(press(Q), 400);
            send(release(Q), 30);
        });

        let started = Instant::now();
        pipeline.run().unwrap();
        feeder.join().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));

        written(&pipeline)
    }

    fn expected_live() -> Vec<(u16, u32)> {
        vec![
            key(S, PRESS),
            SYN,
            key(S, RELEASE),
            SYN,
            key(Q, PRESS),
            SYN,
            key(Q, RELEASE),
        ]
    }

    #[test]
    fn test_live_thread_timers() {
        assert_eq!(live_session(ThreadTimers::spawn), expected_live());
    }

    #[test]
    fn test_live_deadline_queue() {
        assert_eq!(
            live_session(|stream| DeadlineQueue::new(stream).unwrap()),
            expected_live()
        );
    }

    #[test]
    fn test_live_poll_loop() {
        assert_eq!(live_session(PollLoop::new), expected_live());
    }
}
