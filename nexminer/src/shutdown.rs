// Copyright (C) 2020  Nexminer contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Backend initiated shutdown signalling. Any backend task that detects an
//! unrecoverable condition sends a reason; the application waits on the
//! receiver and tears the process down.

use tokio::sync::mpsc;

#[derive(Clone)]
pub struct Sender {
    inner: mpsc::UnboundedSender<String>,
}

impl Sender {
    pub fn send(&self, reason: impl Into<String>) {
        // the receiver going away means shutdown is already in progress
        let _ = self.inner.send(reason.into());
    }
}

pub struct Receiver {
    inner: mpsc::UnboundedReceiver<String>,
}

impl Receiver {
    /// Wait for the first shutdown request
    pub async fn receive(&mut self) -> Option<String> {
        self.inner.recv().await
    }
}

pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Sender { inner: tx }, Receiver { inner: rx })
}
