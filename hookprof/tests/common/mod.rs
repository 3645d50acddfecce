#![allow(dead_code)]

use hookprof::catalog::{Function, Module};
use hookprof::domain::{Pid, SymbolError};
use hookprof::modules::{ModuleRequest, SymbolProvider};
use hookprof::session::{CaptureContext, CaptureParams, RecordingSink, TargetProcess};
use hookprof::transport::{Link, Message};
use hookprof_common::MessageType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GAME: &str = "/opt/studio/game";
pub const GAME_BASE: u64 = 0x5555_0000_0000;

/// In-memory link that records every frame sent to the stub
#[derive(Default)]
pub struct MemoryLink {
    connected: AtomicBool,
    sent: Mutex<Vec<Message>>,
}

impl MemoryLink {
    pub fn connected() -> Arc<Self> {
        let link = Arc::new(Self::default());
        link.set_connected(true);
        link
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn kinds(&self) -> Vec<MessageType> {
        self.sent.lock().unwrap().iter().map(|m| m.kind).collect()
    }

    pub fn sent_of(&self, kind: MessageType) -> Vec<Message> {
        self.sent.lock().unwrap().iter().filter(|m| m.kind == kind).cloned().collect()
    }
}

impl Link for MemoryLink {
    fn send(&self, message: Message) {
        self.sent.lock().unwrap().push(message);
    }

    fn has_connection(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Symbol provider serving fixed function tables
pub struct TableProvider {
    tables: Vec<(String, Vec<(&'static str, u64, u64)>)>,
}

impl TableProvider {
    pub fn game() -> Self {
        Self {
            tables: vec![(
                GAME.to_string(),
                vec![
                    ("Game::Tick()", 0x1000, 0x80),
                    ("Renderer::DrawFrame()", 0x1100, 0x200),
                    ("Physics::Step(float)", 0x1300, 0x100),
                    ("tiny_thunk", 0x1400, 2),
                    ("orbit_api::Start(char const*)", 0x1500, 0x20),
                    ("orbit_api::Stop()", 0x1520, 0x20),
                ],
            )],
        }
    }
}

impl SymbolProvider for TableProvider {
    fn load(&self, request: &ModuleRequest) -> Result<Module, SymbolError> {
        let (_, functions) = self
            .tables
            .iter()
            .find(|(path, _)| *path == request.path)
            .ok_or_else(|| SymbolError::Unavailable(request.path.clone().into()))?;
        let mut module = Module::new(&request.path, request.base_address, request.size, 0);
        for (name, address, size) in functions {
            module
                .add_function(Function::new(*name, *address, *size))
                .map_err(|e| SymbolError::Parse { path: request.path.clone().into(), message: e.to_string() })?;
        }
        Ok(module)
    }
}

pub fn game_target() -> TargetProcess {
    TargetProcess {
        pid: Pid(4242),
        path: GAME.to_string(),
        modules: vec![ModuleRequest::new(GAME, GAME_BASE, 0x10_0000)],
    }
}

/// Virtual address of a function in the game module
pub fn vaddr(address: u64) -> u64 {
    GAME_BASE + address
}

/// Session on the game target with symbols loaded and a connected in-memory link
pub fn game_session(params: CaptureParams) -> (CaptureContext, Arc<MemoryLink>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let mut ctx = CaptureContext::new(params, Arc::new(TableProvider::game()), sink.clone());
    let link = MemoryLink::connected();
    ctx.attach_link(link.clone());
    ctx.set_target(game_target()).unwrap();
    let outcomes = ctx.wait_for_symbols(Duration::from_secs(5));
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].functions, 6);
    (ctx, link, sink)
}
