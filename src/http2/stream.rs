//! Per-stream state machine and flow-control accounting.

use crate::errors::{Http2ErrorCode, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    /// Bytes this side may still send before awaiting WINDOW_UPDATE.
    pub send_window: i64,
    /// Bytes the peer may still send us before we must WINDOW_UPDATE.
    pub recv_window: i64,
    pub weight: u8,
    pub depends_on: Option<u32>,
}

impl Stream {
    pub fn new(id: u32, initial_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window: initial_window as i64,
            recv_window: initial_window as i64,
            weight: 16,
            depends_on: None,
        }
    }

    /// Applies a state transition for an inbound HEADERS frame.
    pub fn on_headers_received(&mut self, end_stream: bool) -> Result<(), ProtocolError> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            StreamState::Open if end_stream => {
                self.state = StreamState::HalfClosedRemote;
                Ok(())
            }
            StreamState::Open => Ok(()),
            _ => Err(ProtocolError::Http2(Http2ErrorCode::StreamClosed)),
        }
    }

    pub fn on_data_received(&mut self, len: usize, end_stream: bool) -> Result<(), ProtocolError> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {
                self.recv_window -= len as i64;
                if self.recv_window < 0 {
                    return Err(ProtocolError::Http2(Http2ErrorCode::FlowControlError));
                }
                if end_stream {
                    self.state = if self.state == StreamState::HalfClosedLocal {
                        StreamState::Closed
                    } else {
                        StreamState::HalfClosedRemote
                    };
                }
                Ok(())
            }
            _ => Err(ProtocolError::Http2(Http2ErrorCode::StreamClosed)),
        }
    }

    /// Marks outbound data sent, decrementing the send window.
    pub fn on_data_sent(&mut self, len: usize, end_stream: bool) {
        self.send_window -= len as i64;
        if end_stream {
            self.state = if self.state == StreamState::HalfClosedRemote {
                StreamState::Closed
            } else {
                StreamState::HalfClosedLocal
            };
        }
    }

    pub fn on_window_update(&mut self, increment: u32) -> Result<(), ProtocolError> {
        self.send_window = self
            .send_window
            .checked_add(increment as i64)
            .ok_or(ProtocolError::Http2(Http2ErrorCode::FlowControlError))?;
        if self.send_window > i32::MAX as i64 {
            return Err(ProtocolError::Http2(Http2ErrorCode::FlowControlError));
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Max DATA bytes this stream may send right now, bounded by its own
    /// window; the driver additionally bounds by the connection window.
    pub fn sendable(&self) -> usize {
        self.send_window.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_to_open_on_headers_without_end_stream() {
        let mut stream = Stream::new(1, 65_535);
        stream.on_headers_received(false).unwrap();
        assert_eq!(stream.state, StreamState::Open);
    }

    #[test]
    fn idle_to_half_closed_remote_on_headers_with_end_stream() {
        let mut stream = Stream::new(1, 65_535);
        stream.on_headers_received(true).unwrap();
        assert_eq!(stream.state, StreamState::HalfClosedRemote);
    }

    #[test]
    fn data_beyond_recv_window_is_flow_control_error() {
        let mut stream = Stream::new(1, 10);
        stream.state = StreamState::Open;
        let err = stream.on_data_received(11, false).unwrap_err();
        assert_eq!(err, ProtocolError::Http2(Http2ErrorCode::FlowControlError));
    }

    #[test]
    fn window_update_increases_send_window() {
        let mut stream = Stream::new(1, 0);
        stream.on_window_update(100).unwrap();
        assert_eq!(stream.send_window, 100);
    }

    #[test]
    fn data_on_closed_stream_is_rejected() {
        let mut stream = Stream::new(1, 65_535);
        stream.close();
        assert!(stream.on_data_received(1, false).is_err());
    }
}
