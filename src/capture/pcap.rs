//! PCAP-backed frame sources
//!
//! This module reads frames from PCAP files and live interfaces through the
//! `pcap` crate. Each source runs its read loop on a dedicated thread and
//! pushes owned [`Frame`]s into a channel; dropping the receiver stops the
//! loop.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::SystemTime;

use pcap::{Active, Capture, Offline};
use tracing::{debug, info, warn};

use crate::capture::{link_type_protocol, CaptureError, CaptureStats, Frame, FrameSource};
use crate::protocols::ProtocolId;

/// PCAP file reader for offline analysis
pub struct PcapFileSource {
    file_path: String,
    /// Capture handle, consumed when the read thread starts
    capture: Option<Capture<Offline>>,
    capture_thread: Option<thread::JoinHandle<()>>,
    running: Arc<Mutex<bool>>,
    stats: Arc<Mutex<CaptureStats>>,
    filter: Option<String>,
}

impl PcapFileSource {
    /// Open a PCAP file
    pub fn new(file_path: &str) -> Result<Self, CaptureError> {
        let capture: Capture<Offline> = Capture::from_file(file_path)
            .map_err(|e: pcap::Error| CaptureError::Pcap(e.to_string()))?;

        Ok(Self {
            file_path: file_path.to_string(),
            capture: Some(capture),
            capture_thread: None,
            running: Arc::new(Mutex::new(false)),
            stats: Arc::new(Mutex::new(CaptureStats {
                start_time: Some(SystemTime::now()),
                ..Default::default()
            })),
            filter: None,
        })
    }
}

impl FrameSource for PcapFileSource {
    fn start_capture(&mut self, sender: mpsc::Sender<Frame>) -> Result<(), CaptureError> {
        let mut running: std::sync::MutexGuard<'_, bool> = self.running.lock().unwrap();
        if *running {
            return Err(CaptureError::Capture("Capture already running".to_string()));
        }

        let mut capture: Capture<Offline> = self
            .capture
            .take()
            .ok_or_else(|| CaptureError::Capture("Capture handle not available".to_string()))?;

        if let Some(filter) = &self.filter {
            capture
                .filter(filter, true)
                .map_err(|e: pcap::Error| CaptureError::Pcap(e.to_string()))?;
        }

        // The whole file shares one link type
        let initial_protocol: ProtocolId = link_type_protocol(capture.get_datalink())?;
        info!(
            file = %self.file_path,
            link_type = capture.get_datalink().0,
            "reading capture file"
        );

        *running = true;
        let running_clone: Arc<Mutex<bool>> = Arc::clone(&self.running);
        let stats_clone: Arc<Mutex<CaptureStats>> = Arc::clone(&self.stats);

        let handle: thread::JoinHandle<()> = thread::spawn(move || {
            while *running_clone.lock().unwrap() {
                match capture.next_packet() {
                    Ok(packet) => {
                        let mut stats: std::sync::MutexGuard<'_, CaptureStats> =
                            stats_clone.lock().unwrap();
                        stats.frames_captured += 1;
                        stats.bytes_captured += packet.data.len();
                        drop(stats);

                        let frame: Frame = Frame::from_packet(&packet, initial_protocol);
                        if sender.send(frame).is_err() {
                            // Receiver has been dropped, stop the capture
                            *running_clone.lock().unwrap() = false;
                            break;
                        }
                    }
                    Err(pcap::Error::NoMorePackets) => {
                        debug!("end of capture file");
                        *running_clone.lock().unwrap() = false;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read frame");
                        stats_clone.lock().unwrap().frames_dropped += 1;
                    }
                }
            }
        });

        self.capture_thread = Some(handle);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), CaptureError> {
        let mut running = self.running.lock().unwrap();
        if !*running {
            return Ok(());
        }
        *running = false;
        drop(running);

        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn get_stats(&self) -> CaptureStats {
        self.stats.lock().unwrap().clone()
    }

    fn set_filter(&mut self, filter: &str) -> Result<(), CaptureError> {
        if self.capture_thread.is_some() {
            return Err(CaptureError::Capture(
                "Cannot set filter while capture is running".to_string(),
            ));
        }
        self.filter = Some(filter.to_string());
        Ok(())
    }
}

/// Live interface frame source
pub struct PcapLiveSource {
    interface: String,
    capture: Option<Capture<Active>>,
    capture_thread: Option<thread::JoinHandle<()>>,
    running: Arc<Mutex<bool>>,
    stats: Arc<Mutex<CaptureStats>>,
    filter: Option<String>,
}

impl PcapLiveSource {
    /// Open a network interface for capture
    pub fn new(interface: &str, promiscuous: bool) -> Result<Self, CaptureError> {
        let capture: Capture<Active> = Capture::from_device(interface)
            .map_err(|e: pcap::Error| CaptureError::Interface(e.to_string()))?
            .promisc(promiscuous)
            .snaplen(65535)
            .timeout(1000)
            .open()
            .map_err(|e: pcap::Error| CaptureError::Interface(e.to_string()))?;

        Ok(Self {
            interface: interface.to_string(),
            capture: Some(capture),
            capture_thread: None,
            running: Arc::new(Mutex::new(false)),
            stats: Arc::new(Mutex::new(CaptureStats {
                start_time: Some(SystemTime::now()),
                ..Default::default()
            })),
            filter: None,
        })
    }
}

impl FrameSource for PcapLiveSource {
    fn start_capture(&mut self, sender: mpsc::Sender<Frame>) -> Result<(), CaptureError> {
        let mut running: std::sync::MutexGuard<'_, bool> = self.running.lock().unwrap();
        if *running {
            return Err(CaptureError::Capture("Capture already running".to_string()));
        }

        let mut capture: Capture<Active> = self
            .capture
            .take()
            .ok_or_else(|| CaptureError::Capture("Capture handle not available".to_string()))?;

        if let Some(filter) = &self.filter {
            capture
                .filter(filter, true)
                .map_err(|e: pcap::Error| CaptureError::Pcap(e.to_string()))?;
        }

        let initial_protocol: ProtocolId = link_type_protocol(capture.get_datalink())?;
        info!(
            interface = %self.interface,
            link_type = capture.get_datalink().0,
            "capturing from interface"
        );

        *running = true;
        let running_clone: Arc<Mutex<bool>> = Arc::clone(&self.running);
        let stats_clone: Arc<Mutex<CaptureStats>> = Arc::clone(&self.stats);

        let handle: thread::JoinHandle<()> = thread::spawn(move || {
            while *running_clone.lock().unwrap() {
                match capture.next_packet() {
                    Ok(packet) => {
                        let mut stats: std::sync::MutexGuard<'_, CaptureStats> =
                            stats_clone.lock().unwrap();
                        stats.frames_captured += 1;
                        stats.bytes_captured += packet.data.len();
                        drop(stats);

                        let frame: Frame = Frame::from_packet(&packet, initial_protocol);
                        if sender.send(frame).is_err() {
                            *running_clone.lock().unwrap() = false;
                            break;
                        }
                    }
                    // The read timeout lets the loop observe the stop flag
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        warn!(error = %e, "failed to read frame");
                        stats_clone.lock().unwrap().frames_dropped += 1;
                    }
                }
            }
        });

        self.capture_thread = Some(handle);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), CaptureError> {
        let mut running = self.running.lock().unwrap();
        if !*running {
            return Ok(());
        }
        *running = false;
        drop(running);

        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn get_stats(&self) -> CaptureStats {
        self.stats.lock().unwrap().clone()
    }

    fn set_filter(&mut self, filter: &str) -> Result<(), CaptureError> {
        if self.capture_thread.is_some() {
            return Err(CaptureError::Capture(
                "Cannot set filter while capture is running".to_string(),
            ));
        }
        self.filter = Some(filter.to_string());
        Ok(())
    }
}
