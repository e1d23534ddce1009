pub mod probe;
pub mod slot;

pub use probe::{DisplayProbe, X11SocketProbe, wait_for_display};
pub use slot::{DisplaySlot, SlotAllocator, SlotReservation};
