//! End-to-end scenarios exercising several tiers and several threads at once.
//! Single-module unit tests live next to their components; everything here
//! needs the whole machine.
