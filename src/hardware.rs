//! alert resources on a desktop machine: rodio for the sound, systemd-inhibit for the wake hold.
//! there is no vibrator

use std::{
    fs::File,
    io::BufReader,
    path::Path,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use log::{debug, warn};
use rodio::{source::SineWave, Decoder, OutputStream, Sink, Source};

use crate::{
    alarm::AlarmId,
    config::Sound,
    delivery::{ActiveResource, AlertHardware},
    error::DeliveryError,
};

const FALLBACK_TONE_HZ: f32 = 880.0;

#[derive(Debug, Clone, Default)]
pub struct DesktopHardware {
    sound: Sound,
}

impl DesktopHardware {
    #[must_use]
    pub const fn new(sound: Sound) -> Self {
        Self { sound }
    }
}

impl AlertHardware for DesktopHardware {
    fn acquire_wake_hold(
        &self,
        id: AlarmId,
        bound: Duration,
    ) -> Result<Box<dyn ActiveResource>, DeliveryError> {
        Ok(Box::new(WakeHold::acquire(id, bound)?))
    }

    fn start_sound(&self, id: AlarmId) -> Result<Box<dyn ActiveResource>, DeliveryError> {
        Ok(Box::new(Ringer::start(id, &self.sound)?))
    }

    fn start_vibration(
        &self,
        _id: AlarmId,
        _pattern: &[u64],
    ) -> Result<Box<dyn ActiveResource>, DeliveryError> {
        Err(DeliveryError::Vibration(
            "this device has no vibrator".to_string(),
        ))
    }
}

/// blocks sleep for at most `bound` by holding a systemd inhibitor lock
#[derive(Debug)]
struct WakeHold {
    id: AlarmId,
    child: Option<Child>,
}

impl WakeHold {
    fn acquire(id: AlarmId, bound: Duration) -> Result<Self, DeliveryError> {
        // the inhibitor lives as long as `sleep`, so the bound holds even if we never release it
        let child = Command::new("systemd-inhibit")
            .args(["--what=sleep:idle", "--who=roosty_alarm"])
            .arg(format!("--why=alarm {id} ringing"))
            .args(["--mode=block", "sleep"])
            .arg(bound.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| DeliveryError::WakeHold(err.to_string()))?;
        debug!("wake hold for alarm {id} acquired for {bound:?}");
        Ok(Self {
            id,
            child: Some(child),
        })
    }
}

impl ActiveResource for WakeHold {
    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            // it may already have run out on its own
            let _ = child.kill();
            let _ = child.wait();
            debug!("wake hold for alarm {} released", self.id);
        }
    }
}

impl Drop for WakeHold {
    fn drop(&mut self) {
        self.stop();
    }
}

/// a looping alarm sound on its own output thread (rodio streams can't move between threads)
#[derive(Debug)]
struct Ringer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ringer {
    fn start(id: AlarmId, sound: &Sound) -> Result<Self, DeliveryError> {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (ready, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let path = sound.path.clone();
        let volume = sound.volume;

        let handle = thread::Builder::new()
            .name(format!("alarm-{id}-sound"))
            .spawn(move || {
                let (_stream, stream_handle) = match OutputStream::try_default() {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready.send(Err(err.to_string()));
                        return;
                    }
                };
                let sink = match Sink::try_new(&stream_handle) {
                    Ok(sink) => sink,
                    Err(err) => {
                        let _ = ready.send(Err(err.to_string()));
                        return;
                    }
                };
                sink.set_volume(volume / 100.0);
                append_alarm_sound(&sink, path.as_deref());
                sink.play();
                let _ = ready.send(Ok(()));
                // returns once the ringer drops its sender
                let _ = stop_rx.recv();
                sink.stop();
            })
            .map_err(|err| DeliveryError::Sound(err.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop),
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(DeliveryError::Sound(err))
            }
            Err(_) => Err(DeliveryError::Sound(
                "sound thread exited before playing".to_string(),
            )),
        }
    }
}

/// loops the configured file, or a plain tone if there is none
fn append_alarm_sound(sink: &Sink, path: Option<&Path>) {
    if let Some(path) = path {
        let decoded = File::open(path)
            .map_err(|err| err.to_string())
            .and_then(|file| Decoder::new(BufReader::new(file)).map_err(|err| err.to_string()));
        match decoded {
            Ok(decoder) => {
                sink.append(decoder.repeat_infinite());
                return;
            }
            Err(err) => warn!(
                "couldn't play {}: {err}, using the built-in tone",
                path.display()
            ),
        }
    }
    sink.append(SineWave::new(FALLBACK_TONE_HZ).amplify(0.5));
}

impl ActiveResource for Ringer {
    fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sound thread panicked");
            }
        }
    }
}

impl Drop for Ringer {
    fn drop(&mut self) {
        self.stop();
    }
}
