macro_rules! tokdbg {
    ($dir:expr, $tok:expr) => {
        #[cfg(feature="debug_packets")] {
            eprintln!("{} {:?}", $dir, $tok);
        }
        log::trace!("{} {:?}", $dir, $tok);
    }
}

macro_rules! outdbg {
    ($item:expr) => {
        #[cfg(feature="debug_packets")] {
            eprintln!("OUT {:?}", $item);
        }
    }
}
