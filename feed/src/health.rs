/// Connection health of the multiplexed stream, published through a watch
/// channel so consumers can render it without polling the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionHealth {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

impl ConnectionHealth {
    pub fn is_connected(self) -> bool {
        self == ConnectionHealth::Connected
    }
}
