//! Metric-learning components: distances, condensed pair addressing,
//! triplet sampling and the losses built on them

pub mod condensed;
pub mod distance;
pub mod losses;
pub mod sampling;

pub use condensed::{condensed_index, condensed_indices, condensed_len, condensed_pair, square_form};
pub use distance::Distance;
pub use losses::*;
pub use sampling::{TripletSampling, Triplets};
