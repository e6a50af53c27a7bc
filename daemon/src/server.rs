//! Control channel server
//!
//! Accepts TCP connections and feeds framed command records to the
//! executor. Each connection runs on its own thread; executor access is
//! serialized through the shared mutex the bus loop uses as well.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::*;

use drift_core::control::types::{ControlCommand, ControlResult};
use drift_core::control::wire;
use drift_core::executor::CommandExecutor;

pub struct ControlServer {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn start(
        port: u16,
        executor: Arc<Mutex<CommandExecutor>>,
        running: Arc<AtomicBool>,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;

        info!("Control server listening on TCP port {}", port);

        let accept_running = running.clone();
        let thread = thread::spawn(move || {
            Self::accept_loop(listener, accept_running, executor, token);
        });

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn accept_loop(
        listener: TcpListener,
        running: Arc<AtomicBool>,
        executor: Arc<Mutex<CommandExecutor>>,
        token: Option<String>,
    ) {
        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("Control connection from {}", addr);
                    let executor = executor.clone();
                    let token = token.clone();
                    thread::spawn(move || {
                        if let Err(e) = Self::handle_connection(stream, executor, token) {
                            // Framing errors close the connection
                            debug!("Control connection error: {:#}", e);
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    error!("Control accept error: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn handle_connection(
        stream: TcpStream,
        executor: Arc<Mutex<CommandExecutor>>,
        token: Option<String>,
    ) -> anyhow::Result<()> {
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(30)))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;

        while let Some(command) = wire::read_command(&mut reader)? {
            let result = if !Self::check_token(&command, &token) {
                warn!("Control command with missing or invalid token");
                ControlResult::error("ERROR_AUTHENTICATION")
            } else {
                executor.lock().unwrap().process_command(&command)
            };

            wire::write_result(&mut writer, &result)?;
        }

        Ok(())
    }

    fn check_token(command: &ControlCommand, token: &Option<String>) -> bool {
        match token {
            None => true,
            Some(expected) => command.param("token") == Some(expected.as_str()),
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}
