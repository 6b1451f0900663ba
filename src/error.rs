/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),
    #[error("Period size must be a multiple of the SYT interval, got {0}")]
    InvalidPeriodSize(usize),
    #[error("Buffer count must be at least 2, got {0}")]
    InvalidBufferCount(usize),
    #[error("Stream dimension must be non-zero and at most 64, got {0}")]
    InvalidDimension(usize),
    #[error("Port position {position} does not fit a frame of {dimension} quadlets")]
    PortPositionOutOfRange { position: usize, dimension: usize },
    #[error("MIDI mux location must be in 1..=8, got {0}")]
    InvalidMidiLocation(usize),
    #[error("A port named '{0}' is already registered on this stream")]
    DuplicatePortName(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Diagnostic)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("ISO channel {0} is already in use")]
    ChannelInUse(u8),
    #[error("ISO channel is not started")]
    NotStarted,
    #[error("poll failed: errno {0}")]
    PollError(i32),
    #[error("Transport rejected the packet stream: {0}")]
    StreamRejected(String),
    #[error("Transport is shut down")]
    ShutDown,
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Error, Debug, Diagnostic)]
pub enum StreamError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("Stream is in state {actual}, operation requires {required}")]
    InvalidState {
        actual: &'static str,
        required: &'static str,
    },
    #[error("Receive buffer overrun")]
    Overrun,
    #[error("Transmit buffer underrun")]
    Underrun,
}

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("Stream error: {0}")]
    StreamError(#[from] StreamError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Ports can only be registered while the engine is stopped")]
    RegisterWhileRunning,
    #[error("No such port: {0}")]
    NoSuchPort(u32),
    #[error("No such stream: {0}")]
    NoSuchStream(u32),
    #[error("Engine has no registered streams")]
    NoStreams,
    #[error("Engine is not running")]
    NotRunning,
    #[error("Engine is already running")]
    AlreadyRunning,
    #[error("Streams did not reach the running state in time:\n{report}")]
    StartTimeout { report: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
