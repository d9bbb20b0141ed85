/// The four-flag protocol state of one peer-wire connection. `choking` and
/// `interested` describe our stance toward the peer; `peer_choking` and
/// `peer_interested` describe the peer's stance toward us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnState {
    pub choking: bool,
    pub interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState {
            choking: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}
