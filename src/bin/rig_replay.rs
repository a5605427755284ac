use anyhow::Result;
use nalgebra::Vector3;
use std::cell::{Cell, RefCell};
use std::fs;
use std::io::Write;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use talava_rig::config::Config;
use talava_rig::projection::{rotation_of, translation_of, CameraFrame};
use talava_rig::recording::{BodyAnimData, BodyPlayer};
use talava_rig::scene::memory::{MemoryModel, StaticArSession};
use talava_rig::scene::{BodyIkDelegate, ModelNode};
use talava_rig::tracker::{BodyIkController, TrackedState};

const CONFIG_PATH: &str = "config.toml";
/// この行数ごとにモデル位置を出力
const REPORT_INTERVAL: usize = 30;

type LogFile = Arc<Mutex<std::io::BufWriter<std::fs::File>>>;

fn open_log_file() -> Result<LogFile> {
    fs::create_dir_all("logs")?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = format!("logs/rig_replay_{}.log", ts);
    let file = std::fs::File::create(&path)?;
    eprintln!("Log: {}", path);
    Ok(Arc::new(Mutex::new(std::io::BufWriter::new(file))))
}

macro_rules! log {
    ($logfile:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        println!("{}", msg);
        if let Ok(mut f) = $logfile.lock() {
            let _ = writeln!(f, "{}", msg);
        }
    }};
}

/// Usage: rig_replay <recording.json> [config.toml]
fn parse_args() -> Option<(String, String)> {
    let args: Vec<String> = std::env::args().collect();
    let recording = args.get(1)?.clone();
    let config = args.get(2).cloned().unwrap_or_else(|| CONFIG_PATH.to_string());
    Some((recording, config))
}

#[derive(Default)]
struct ReplayEvents {
    state_changes: Cell<usize>,
    last_state: Cell<TrackedState>,
}

impl BodyIkDelegate for ReplayEvents {
    fn on_body_track_state_update(&self, state: TrackedState) {
        self.state_changes.set(self.state_changes.get() + 1);
        self.last_state.set(state);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let Some((recording_path, config_path)) = parse_args() else {
        eprintln!("Usage: rig_replay <recording.json> [config.toml]");
        std::process::exit(2);
    };

    let config = Config::load_or_default(&config_path)?;
    let data = BodyAnimData::load(&recording_path)?;
    let logfile = open_log_file()?;

    log!(logfile, "Rig Replay");
    log!(logfile, "Recording: {}", recording_path);
    log!(logfile, "Rows: {} ({:.1}s)", data.rows.len(), data.duration_ms() / 1000.0);
    log!(logfile, "Bone lengths: {}", data.bone_lengths.len());

    // 記録開始時と同じ位置にモデルを置く
    let start = data.start_world_matrix();
    let model = Rc::new(RefCell::new(MemoryModel::humanoid()));
    model
        .borrow_mut()
        .set_world_transform(translation_of(&start), rotation_of(&start));

    let camera = CameraFrame::look_at(Vector3::zeros(), Vector3::new(0.0, 0.0, -1.0), 60.0, 640, 480);
    let session = Rc::new(StaticArSession::new(camera));
    let mut controller = BodyIkController::new(config.engine, session);
    controller.bind_model(&model)?;
    let events = Rc::new(ReplayEvents::default());
    controller.set_delegate(&events);

    controller.on_body_playback_starting(&data);
    let mut player = BodyPlayer::new(data);
    let mut frames = 0usize;
    while let Some(joints) = player.next_row() {
        controller.on_body_joints_playback(&joints);
        frames += 1;
        if frames % REPORT_INTERVAL == 0 {
            let p = model.borrow().world_position();
            log!(logfile, "[{:>5}] root=({:.3}, {:.3}, {:.3}) joints={}", frames, p.x, p.y, p.z, joints.len());
        }
    }

    let p = model.borrow().world_position();
    let targets = model.borrow().rig().map_or(0, |r| r.targets.len());
    log!(logfile, "");
    log!(logfile, "Frames replayed: {}", frames);
    log!(logfile, "Final root: ({:.3}, {:.3}, {:.3})", p.x, p.y, p.z);
    log!(logfile, "Scale: {:.3}", model.borrow().scale().x);
    log!(logfile, "Effector targets: {}", targets);
    log!(logfile, "State: {:?} ({} changes)", events.last_state.get(), events.state_changes.get());

    if let Ok(mut f) = logfile.lock() {
        f.flush()?;
    }
    Ok(())
}
