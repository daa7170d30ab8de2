// PSP PROXY — PROTOCOL LAYER
// wire:   on-wire constants, header/footer, request and notification payloads
// framer: frame emitter and the receive state machine with byte-wise resync

pub mod framer;
pub mod wire;
