pub mod downmix;
