mod test_inbound;
mod test_outbound;
mod test_state;
