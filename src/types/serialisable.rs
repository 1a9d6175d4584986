/// Types implementing UpsdSerialisable can be sent over the upsd TCP
/// connection in the client -> server direction.
pub trait UpsdSerialisable {
    /// Converts the value in question to a newline-terminated upsd request.
    fn serialise_upsd(&self) -> Vec<u8>;
}
