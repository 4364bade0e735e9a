//! Hardware drivers for biosignal acquisition
//!
//! - [`ads1299`]: TI ADS1299 24-bit EEG ADC, on-board chip plus daisy module

pub mod ads1299;
