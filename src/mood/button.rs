//! Button handling
//!
//! Releasing the button on the server picks the next mood, shows it locally
//! and pushes it to every client.

use std::sync::Arc;

use tracing::{info, trace};

use crate::network::{ConnectError, ServerHandle};

use super::renderer::Renderer;

/// How a button release picks the next mood
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CyclePolicy {
    /// Switch to the first mood when the second is active, else to the second
    Toggle(String, String),
    /// Step through the renderer's moods, wrapping around
    Advance,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        CyclePolicy::Toggle("happy".to_string(), "sad".to_string())
    }
}

/// Button release handler of the server
pub struct MoodCycler {
    renderer: Arc<dyn Renderer>,
    server: ServerHandle,
    policy: CyclePolicy,
}

impl MoodCycler {
    pub fn new(renderer: Arc<dyn Renderer>, server: ServerHandle, policy: CyclePolicy) -> Self {
        Self {
            renderer,
            server,
            policy,
        }
    }

    /// Mood the next release switches to
    pub fn next_mood(&self) -> Option<String> {
        let active = self.renderer.active();
        match &self.policy {
            CyclePolicy::Toggle(first, second) => {
                if active.as_deref() == Some(second.as_str()) {
                    Some(first.clone())
                } else {
                    Some(second.clone())
                }
            }
            CyclePolicy::Advance => {
                let moods = self.renderer.moods();
                let next = active
                    .and_then(|a| moods.iter().position(|m| *m == a))
                    .map_or(0, |i| (i + 1) % moods.len());
                moods.get(next).cloned()
            }
        }
    }

    pub fn on_press(&self) {
        trace!("Button pressed");
    }

    /// Switch to the next mood and broadcast it
    pub fn on_release(&self) -> Result<Option<String>, ConnectError> {
        let Some(mood) = self.next_mood() else {
            return Ok(None);
        };
        self.renderer.set_mood(&mood);
        self.server.broadcast_update(&mood)?;
        info!("Key press handled");
        Ok(Some(mood))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::mood::MoodBoard;
    use crate::network::{MacAddress, Server, ServerConfig, SimulatedAir};
    use crate::protocol::{EventKind, Packet};

    fn server(air: &Arc<SimulatedAir>) -> Server {
        let radio = air.radio(MacAddress::random());
        let config = ServerConfig {
            sync_interval: Duration::from_secs(3600),
            ..ServerConfig::default()
        };
        Server::start(radio, Arc::new(ManualClock::new(0)), config).unwrap()
    }

    fn air() -> Arc<SimulatedAir> {
        let air = SimulatedAir::new();
        air.add_access_point("moods", 1, None);
        air
    }

    fn broadcast_moods(air: &SimulatedAir) -> Vec<String> {
        air.transmissions()
            .iter()
            .filter_map(|tx| Packet::validate(&tx.data).ok())
            .filter(|p| p.kind == EventKind::Update)
            .filter_map(|p| p.mood().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_toggle_alternates_and_broadcasts() {
        let air = air();
        let server = server(&air);
        let board = Arc::new(MoodBoard::with_default_moods());
        let cycler = MoodCycler::new(board.clone(), server.handle(), CyclePolicy::default());

        assert_eq!(cycler.on_release().unwrap().as_deref(), Some("sad"));
        assert_eq!(cycler.on_release().unwrap().as_deref(), Some("happy"));
        assert_eq!(cycler.on_release().unwrap().as_deref(), Some("sad"));

        assert_eq!(board.active().as_deref(), Some("sad"));
        assert_eq!(broadcast_moods(&air), vec!["sad", "happy", "sad"]);
    }

    #[tokio::test]
    async fn test_advance_wraps_around() {
        let air = air();
        let server = server(&air);
        let board = Arc::new(MoodBoard::new());
        board.add("a");
        board.add("b");
        let cycler = MoodCycler::new(board.clone(), server.handle(), CyclePolicy::Advance);

        assert_eq!(cycler.next_mood().as_deref(), Some("a"));
        cycler.on_release().unwrap();
        assert_eq!(cycler.next_mood().as_deref(), Some("b"));
        cycler.on_release().unwrap();
        assert_eq!(cycler.next_mood().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_advance_on_empty_board() {
        let air = air();
        let server = server(&air);
        let cycler = MoodCycler::new(Arc::new(MoodBoard::new()), server.handle(), CyclePolicy::Advance);
        assert_eq!(cycler.on_release().unwrap(), None);
    }
}
