// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use macrocast::hotkey::HotkeyCommand;
use macrocast::types::{KeyPhase, MouseButton, MousePhase};
use macrocast::{
    GameAction, HotkeyDispatcher, InputActuator, KeyCode, KeyCombo, PlaybackController,
    PlaybackEvent, PlaybackState, Script, ScriptStatus, StopReason,
};

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl InputActuator for Recorder {
    fn key_down(&self, code: KeyCode) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(format!("down {}", code));
        Ok(())
    }

    fn key_up(&self, code: KeyCode) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(format!("up {}", code));
        Ok(())
    }

    fn mouse_move(&self, x: i32, y: i32) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(format!("move {},{}", x, y));
        Ok(())
    }

    fn mouse_button(
        &self,
        button: MouseButton,
        x: i32,
        y: i32,
        phase: MousePhase,
    ) -> anyhow::Result<()> {
        self.0
            .lock()
            .unwrap()
            .push(format!("{:?} {:?} {},{}", phase, button, x, y));
        Ok(())
    }
}

fn three_action_script() -> Script {
    let mut script = Script::new("e2e").unwrap();
    script
        .add_action(0, GameAction::key(KeyCode::Char('w'), KeyPhase::Down, 100).unwrap())
        .unwrap();
    script
        .add_action(0, GameAction::key(KeyCode::Char('w'), KeyPhase::Up, 2_000).unwrap())
        .unwrap();
    script
        .add_action(
            0,
            GameAction::mouse(MouseButton::Left, 40, 12, MousePhase::Down, 2_000).unwrap(),
        )
        .unwrap();
    assert_eq!(script.status(), ScriptStatus::Draft);
    script.activate().unwrap();
    script
}

#[tokio::test(start_paused = true)]
async fn hotkey_stop_returns_controller_to_loaded() {
    let recorder = Arc::new(Recorder::default());
    let controller = PlaybackController::builder(recorder.clone()).build().unwrap();
    let faults_before = controller.faults().count();

    let hotkeys = HotkeyDispatcher::new();
    assert!(hotkeys.register("Ctrl+Q", HotkeyCommand::Stop));
    let listener = controller.listen(hotkeys.subscribe());
    let mut events = controller.subscribe();

    controller.load(three_action_script()).unwrap();
    assert_eq!(controller.current_state(), PlaybackState::Loaded);
    controller.play().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(controller.current_state(), PlaybackState::Playing);
    assert_eq!(recorder.count(), 1);

    // the OS message arrives on some other thread
    let combo: KeyCombo = "ctrl-q".parse().unwrap();
    let native_id = combo.native_id();
    let interrupter = hotkeys.clone();
    std::thread::spawn(move || assert!(interrupter.dispatch(native_id)))
        .join()
        .unwrap();

    tokio::time::timeout(Duration::from_millis(10), controller.wait_until_stopped())
        .await
        .expect("stop took longer than one scheduling quantum");

    assert_eq!(controller.current_state(), PlaybackState::Loaded);
    assert_eq!(controller.faults().count(), faults_before);

    // nothing else is dispatched once stopped
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.count(), 1);

    let stops: Vec<StopReason> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            PlaybackEvent::Stopped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(stops, vec![StopReason::Requested]);

    // stopping again is a no-op
    controller.stop();
    assert_eq!(controller.current_state(), PlaybackState::Loaded);

    listener.abort();
}

#[tokio::test(start_paused = true)]
async fn pause_hotkey_toggles_playback() {
    let recorder = Arc::new(Recorder::default());
    let controller = PlaybackController::builder(recorder.clone()).build().unwrap();

    let hotkeys = HotkeyDispatcher::new();
    assert!(hotkeys.register("Ctrl+P", HotkeyCommand::TogglePause));
    let listener = controller.listen(hotkeys.subscribe());

    controller.load(three_action_script()).unwrap();
    controller.play().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(hotkeys.dispatch_combo(&"Ctrl+P".parse().unwrap()));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(controller.is_paused());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(recorder.count(), 1);

    assert!(hotkeys.dispatch_combo(&"Ctrl+P".parse().unwrap()));
    controller.wait_until_stopped().await;
    assert_eq!(recorder.count(), 3);
    assert_eq!(controller.current_state(), PlaybackState::Loaded);

    listener.abort();
}
